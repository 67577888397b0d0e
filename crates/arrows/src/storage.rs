// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Object storage for datasets
//!
//! A dataset lives under an `s3://bucket/key/` prefix as a set of Parquet
//! files. [`ObjectStorage`] routes each bucket to an `object_store` client:
//! Amazon S3 in production, or a local directory per bucket for development
//! and tests. Concurrent writers to the same prefix are not coordinated.

use crate::config::StorageConfig;
use crate::credentials::CredentialProvider;
use crate::table::Table;
use crate::{Error, Result};
use arrow::array::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use diagnostics::*;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, AwsCredential};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const SCHEME: &str = "s3://";

/// Normalized dataset location: scheme prefixed, trailing slash terminated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetPath {
    url: String,
    bucket: String,
    key: String,
}

impl DatasetPath {
    /// Normalize `path`, adding the scheme and the trailing slash if missing.
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim();
        let rest = match path.get(..SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &path[SCHEME.len()..],
            _ => path,
        };
        if rest.is_empty() {
            return Err(Error::Configuration(format!("empty dataset path: {path:?}")));
        }

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(Error::Configuration(format!(
                "dataset path has no bucket: {path:?}"
            )));
        }

        let key = if key.is_empty() || key.ends_with('/') {
            key.to_string()
        } else {
            format!("{key}/")
        };

        Ok(Self {
            url: format!("{SCHEME}{bucket}/{key}"),
            bucket: bucket.to_string(),
            key,
        })
    }

    /// A fresh, unique path under `bucket`.
    pub fn generate(bucket: &str) -> Result<Self> {
        Self::parse(&format!("{SCHEME}{bucket}/{}/", uuid7::uuid7()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key prefix within the bucket, empty or ending in `/`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All Parquet files directly under the path.
    #[must_use]
    pub fn glob(&self) -> String {
        format!("{}*.parquet", self.url)
    }

    fn prefix(&self) -> ObjectPath {
        ObjectPath::from(self.key.trim_end_matches('/'))
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// What, if anything, is stored at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListType {
    None,
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    /// Each bucket is a subdirectory of `root`.
    Local { root: PathBuf },
}

/// Supplies storage credentials to long-lived S3 clients, so refreshed
/// session tokens are picked up.
#[derive(Debug)]
struct StoreCredentials {
    provider: Arc<dyn CredentialProvider>,
}

#[async_trait]
impl object_store::CredentialProvider for StoreCredentials {
    type Credential = AwsCredential;

    async fn get_credential(&self) -> object_store::Result<Arc<AwsCredential>> {
        let creds = self.provider.storage_credentials().await.map_err(|e| {
            object_store::Error::Generic {
                store: "S3",
                source: Box::new(e),
            }
        })?;
        Ok(Arc::new(AwsCredential {
            key_id: creds.access_key_id,
            secret_key: creds.secret_access_key,
            token: creds.session_token,
        }))
    }
}

pub struct ObjectStorage {
    backend: StorageBackend,
    region: String,
    endpoint: Option<String>,
    credentials: Arc<dyn CredentialProvider>,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("backend", &self.backend)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ObjectStorage {
    pub fn new(
        backend: StorageBackend,
        config: &StorageConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            backend,
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            credentials,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Local directory backend with default configuration.
    pub fn local(root: impl Into<PathBuf>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::new(
            StorageBackend::Local { root: root.into() },
            &StorageConfig::default(),
            credentials,
        )
    }

    #[must_use]
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| Error::Integrity("object store cache poisoned".to_string()))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            StorageBackend::S3 => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(&self.region)
                    .with_credentials(Arc::new(StoreCredentials {
                        provider: self.credentials.clone(),
                    }));
                if let Some(endpoint) = &self.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
            StorageBackend::Local { root } => {
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)?;
                Arc::new(LocalFileSystem::new_with_prefix(dir)?)
            }
        };
        debug!("Opened object store for bucket {bucket}", bucket: bucket);
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    async fn list_objects(&self, path: &DatasetPath) -> Result<Vec<ObjectMeta>> {
        let store = self.store_for(path.bucket())?;
        let prefix = path.prefix();
        let prefix = (!path.key().is_empty()).then_some(&prefix);
        let mut objects: Vec<ObjectMeta> = store.list(prefix).try_collect().await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }

    pub async fn list_type(&self, path: &DatasetPath) -> Result<ListType> {
        if !self.list_objects(path).await?.is_empty() {
            return Ok(ListType::Directory);
        }
        if path.key().is_empty() {
            return Ok(ListType::None);
        }
        let store = self.store_for(path.bucket())?;
        match store.head(&path.prefix()).await {
            Ok(_) => Ok(ListType::File),
            Err(object_store::Error::NotFound { .. }) => Ok(ListType::None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the single object named by `path` without its trailing slash.
    pub async fn delete_file(&self, path: &DatasetPath) -> Result<()> {
        let store = self.store_for(path.bucket())?;
        store.delete(&path.prefix()).await?;
        Ok(())
    }

    /// Delete every object under `path`. Returns the number deleted.
    pub async fn delete_directory_contents(&self, path: &DatasetPath) -> Result<usize> {
        let store = self.store_for(path.bucket())?;
        let locations = futures::stream::iter(
            self.list_objects(path)
                .await?
                .into_iter()
                .map(|meta| Ok(meta.location)),
        )
        .boxed();
        let deleted: Vec<ObjectPath> = store.delete_stream(locations).try_collect().await?;
        debug!(
            "Deleted {count} objects under {path}",
            count: deleted.len(),
            path: path.as_str(),
        );
        Ok(deleted.len())
    }

    /// Delete everything under `path` and the directory entry itself.
    pub async fn delete_directory(&self, path: &DatasetPath) -> Result<()> {
        self.delete_directory_contents(path).await?;
        if let StorageBackend::Local { root } = &self.backend {
            let dir = self.local_dir(root, path);
            if !path.key().is_empty() && dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Make sure the engine can write into `path`.
    pub fn prepare_directory(&self, path: &DatasetPath) -> Result<()> {
        if let StorageBackend::Local { root } = &self.backend {
            std::fs::create_dir_all(self.local_dir(root, path))?;
        }
        Ok(())
    }

    fn local_dir(&self, root: &std::path::Path, path: &DatasetPath) -> PathBuf {
        root.join(path.bucket()).join(path.key().trim_end_matches('/'))
    }

    /// The directory as the query engine addresses it, without trailing slash.
    #[must_use]
    pub fn engine_location(&self, path: &DatasetPath) -> String {
        match &self.backend {
            StorageBackend::S3 => path.as_str().trim_end_matches('/').to_string(),
            StorageBackend::Local { root } => self.local_dir(root, path).display().to_string(),
        }
    }

    /// Glob for every Parquet file under the path, as the engine addresses it.
    #[must_use]
    pub fn engine_glob(&self, path: &DatasetPath) -> String {
        match &self.backend {
            StorageBackend::S3 => path.glob(),
            StorageBackend::Local { .. } => format!("{}/*.parquet", self.engine_location(path)),
        }
    }

    /// Read every Parquet file under `path` into one table, in object name order.
    pub async fn read_columnar(&self, path: &DatasetPath) -> Result<Table> {
        let store = self.store_for(path.bucket())?;
        let files: Vec<ObjectMeta> = self
            .list_objects(path)
            .await?
            .into_iter()
            .filter(|meta| meta.location.as_ref().ends_with(".parquet"))
            .collect();
        if files.is_empty() {
            return Err(Error::NotFound(format!("no parquet files under {path}")));
        }

        let mut schema = None;
        let mut batches = Vec::new();
        for meta in &files {
            let data: Bytes = store.get(&meta.location).await?.bytes().await?;
            let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
            if schema.is_none() {
                schema = Some(builder.schema().clone());
            }
            for batch in builder.build()? {
                batches.push(batch?);
            }
        }
        debug!("Read {files} files from {path}", files: files.len(), path: path.as_str());

        match schema {
            Some(schema) => Table::try_new(schema, batches),
            None => Err(Error::NotFound(format!("no parquet files under {path}"))),
        }
    }

    /// Store `data` as the object `name` under `path`. Returns its full path.
    pub async fn put_file(&self, path: &DatasetPath, name: &str, data: Bytes) -> Result<String> {
        let store = self.store_for(path.bucket())?;
        let location = ObjectPath::from(format!("{}{name}", path.key()));
        store.put(&location, PutPayload::from(data)).await?;
        Ok(format!("{SCHEME}{}/{location}", path.bucket()))
    }

    /// Write `table` under `path` as one or more Parquet files of at most
    /// `max_rows_per_file` rows. An empty table is written as one file
    /// carrying only the schema.
    pub async fn write_columnar(
        &self,
        table: &Table,
        path: &DatasetPath,
        max_rows_per_file: usize,
    ) -> Result<Vec<String>> {
        if max_rows_per_file == 0 {
            return Err(Error::Configuration(
                "max_rows_per_file must be positive".to_string(),
            ));
        }
        let all = table.concat()?;
        let run = uuid7::uuid7();

        let mut written = Vec::new();
        let mut offset = 0;
        loop {
            let len = max_rows_per_file.min(all.num_rows() - offset);
            let chunk = all.slice(offset, len);
            let name = format!("part-{:05}-{run}.parquet", written.len());
            let data = Bytes::from(encode_parquet(&chunk)?);
            written.push(self.put_file(path, &name, data).await?);

            offset += len;
            if offset >= all.num_rows() {
                break;
            }
        }

        info!(
            "Wrote {rows} rows in {files} files to {path}",
            rows: all.num_rows(),
            files: written.len(),
            path: path.as_str(),
        );
        Ok(written)
    }
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(6)?))
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn storage(dir: &tempfile::TempDir) -> ObjectStorage {
        ObjectStorage::local(dir.path(), Arc::new(StaticCredentials::new()))
    }

    fn numbers(n: i64) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from((0..n).collect::<Vec<_>>()))],
        )
        .expect("batch");
        Table::from(batch)
    }

    #[test]
    fn test_parse_normalizes() {
        let p = DatasetPath::parse("bucket/some/key").expect("parse");
        assert_eq!(p.as_str(), "s3://bucket/some/key/");
        assert_eq!(p.bucket(), "bucket");
        assert_eq!(p.key(), "some/key/");
        assert_eq!(p.glob(), "s3://bucket/some/key/*.parquet");

        let p = DatasetPath::parse("S3://bucket/k/").expect("parse");
        assert_eq!(p.as_str(), "s3://bucket/k/");

        let p = DatasetPath::parse("s3://bucket").expect("parse");
        assert_eq!(p.as_str(), "s3://bucket/");
        assert_eq!(p.key(), "");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(DatasetPath::parse("").is_err());
        assert!(DatasetPath::parse("s3://").is_err());
        assert!(DatasetPath::parse("s3:///key").is_err());
    }

    #[test]
    fn test_generate_is_unique() {
        let a = DatasetPath::generate("b").expect("a");
        let b = DatasetPath::generate("b").expect("b");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("s3://b/"));
        assert!(a.as_str().ends_with('/'));
    }

    #[tokio::test]
    async fn test_write_read_multiple_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        let path = DatasetPath::parse("bucket/data").expect("path");

        assert_eq!(storage.list_type(&path).await.expect("list"), ListType::None);

        let files = storage
            .write_columnar(&numbers(25), &path, 10)
            .await
            .expect("write");
        assert_eq!(files.len(), 3);
        assert_eq!(
            storage.list_type(&path).await.expect("list"),
            ListType::Directory
        );

        let table = storage.read_columnar(&path).await.expect("read");
        assert_eq!(table.num_rows(), 25);
        let all = table.concat().expect("concat");
        let n = all
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(n.value(0), 0);
        assert_eq!(n.value(24), 24);
    }

    #[tokio::test]
    async fn test_empty_table_keeps_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        let path = DatasetPath::parse("bucket/empty").expect("path");

        storage
            .write_columnar(&numbers(0), &path, 10)
            .await
            .expect("write");
        let table = storage.read_columnar(&path).await.expect("read");
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.schema().field(0).name(), "n");
    }

    #[tokio::test]
    async fn test_delete_contents_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        let path = DatasetPath::parse("bucket/gone").expect("path");

        storage
            .write_columnar(&numbers(3), &path, 10)
            .await
            .expect("write");
        assert_eq!(storage.delete_directory_contents(&path).await.expect("delete"), 1);
        assert_eq!(storage.delete_directory_contents(&path).await.expect("delete"), 0);
        assert_eq!(storage.list_type(&path).await.expect("list"), ListType::None);

        let err = storage.read_columnar(&path).await.expect_err("empty");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_sibling_prefix_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        let a = DatasetPath::parse("bucket/a").expect("path");
        let ab = DatasetPath::parse("bucket/ab").expect("path");

        storage.write_columnar(&numbers(1), &a, 10).await.expect("write");
        storage.write_columnar(&numbers(2), &ab, 10).await.expect("write");
        storage.delete_directory(&a).await.expect("delete");

        assert_eq!(storage.list_type(&a).await.expect("list"), ListType::None);
        assert_eq!(storage.read_columnar(&ab).await.expect("read").num_rows(), 2);
    }

    #[test]
    fn test_engine_locations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        let path = DatasetPath::parse("bucket/x/y").expect("path");
        let expected = dir.path().join("bucket").join("x/y");
        assert_eq!(storage.engine_location(&path), expected.display().to_string());
        assert!(storage.engine_glob(&path).ends_with("/*.parquet"));
    }
}
