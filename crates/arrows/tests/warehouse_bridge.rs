use anyhow::Result;
use arrow::array::{Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use arrows::credentials::StaticCredentials;
use arrows::template::{Template, vars};
use arrows::testing::RecordingWarehouse;
use arrows::{
    ArrowsConfig, ErrorKind, FetchStrategy, LoadMode, ReadBackend, Session, Table, Warehouse,
};
use std::path::Path;
use std::sync::Arc;

fn sales() -> Table {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("amount", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(Float64Array::from(vec![9.5, 20.0, 3.25])),
        ],
    )
    .expect("batch");
    Table::from(batch)
}

async fn setup(root: &Path) -> Result<(Session, RecordingWarehouse, Warehouse)> {
    let mut config = ArrowsConfig::default().with_default_bucket("scratch");
    config.warehouse.iam_role = Some("arn:aws:iam::123456789012:role/unload".to_string());
    let session = Session::new_local(config, Arc::new(StaticCredentials::new()), root).await?;
    let recorder = RecordingWarehouse::new(session.storage().clone()).with_result(sales());
    let warehouse = session.warehouse(Arc::new(recorder.clone()));
    Ok((session, recorder, warehouse))
}

/// Parquet files anywhere below `dir`.
fn parquet_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .map(|path| {
            if path.is_dir() {
                parquet_files(&path)
            } else {
                usize::from(path.extension().is_some_and(|ext| ext == "parquet"))
            }
        })
        .sum()
}

#[tokio::test]
async fn test_unload_into_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session, recorder, warehouse) = setup(dir.path()).await?;
    let dataset = session.create_dataset(Some("s3://lake/sales"), None)?;

    dataset.from_warehouse(&warehouse, "SELECT * FROM public.sales;").await?;

    let statements = recorder.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0],
        "UNLOAD ('SELECT * FROM public.sales') TO 's3://lake/sales/' \
         IAM_ROLE 'arn:aws:iam::123456789012:role/unload' FORMAT PARQUET"
    );
    assert_eq!(recorder.connection_counts(), (1, 1));

    let read = dataset.to_table(ReadBackend::Columnar).await?;
    assert_eq!(read.to_string(), sales().to_string());
    Ok(())
}

#[tokio::test]
async fn test_fetch_direct() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;

    let table = warehouse
        .fetch("SELECT id, amount FROM public.sales", &FetchStrategy::Direct)
        .await?;
    assert_eq!(table.num_rows(), 3);
    assert_eq!(recorder.connection_counts(), (1, 1));
    Ok(())
}

#[tokio::test]
async fn test_fetch_by_unload_deletes_scratch_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;

    let table = warehouse
        .fetch(
            "SELECT * FROM public.sales",
            &FetchStrategy::Unload { bucket: None },
        )
        .await?;
    assert_eq!(table.to_string(), sales().to_string());

    assert!(recorder.statements()[0].contains("TO 's3://scratch/"));
    assert_eq!(parquet_files(&dir.path().join("scratch")), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_fetch_by_unload_leaves_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;
    let recorder = recorder.fail_on("UNLOAD");

    let err = warehouse
        .fetch(
            "SELECT * FROM public.sales",
            &FetchStrategy::Unload {
                bucket: Some("other".to_string()),
            },
        )
        .await
        .expect_err("unload fails");
    assert_eq!(err.kind(), ErrorKind::TransientIo);
    assert_eq!(recorder.connection_counts(), (1, 1));
    assert_eq!(parquet_files(&dir.path().join("other")), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_read_back_still_deletes_scratch_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;
    let recorder = recorder.with_unreadable_unload();

    let err = warehouse
        .fetch(
            "SELECT * FROM public.sales",
            &FetchStrategy::Unload { bucket: None },
        )
        .await
        .expect_err("read back fails");
    assert_eq!(err.kind(), ErrorKind::Integrity);

    let statements = recorder.statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("UNLOAD ("));
    assert_eq!(recorder.connection_counts(), (1, 1));
    assert_eq!(parquet_files(&dir.path().join("scratch")), 0);
    Ok(())
}

#[tokio::test]
async fn test_fetch_dataframe() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, _recorder, warehouse) = setup(dir.path()).await?;

    let frame = warehouse
        .fetch_dataframe("SELECT id, amount FROM public.sales", &FetchStrategy::Direct)
        .await?;
    assert_eq!(frame.shape(), (3, 2));
    assert_eq!(Table::from_dataframe(&frame)?.to_string(), sales().to_string());
    Ok(())
}

#[tokio::test]
async fn test_execute_commits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;

    warehouse
        .execute("UPDATE public.sales SET amount = 0")
        .await?;
    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "UPDATE public.sales SET amount = 0", "COMMIT"]
    );
    Ok(())
}

#[tokio::test]
async fn test_execute_rolls_back_and_closes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;
    let recorder = recorder.fail_on("DROP");

    warehouse
        .execute("DROP TABLE public.sales")
        .await
        .expect_err("statement fails");
    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "DROP TABLE public.sales", "ROLLBACK"]
    );
    assert_eq!(recorder.connection_counts(), (1, 1));
    Ok(())
}

#[tokio::test]
async fn test_execute_template_rejects_unknown_keys() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;
    let template =
        Template::new("purge", "DELETE FROM public.sales WHERE id = {{ id }}").with_keys(["id"]);

    let err = warehouse
        .execute_template(&template, &vars([("table", "x")]))
        .await
        .expect_err("unknown key");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(recorder.connection_counts(), (0, 0));

    warehouse
        .execute_template(&template, &vars([("id", 7)]))
        .await?;
    assert_eq!(recorder.statements()[1], "DELETE FROM public.sales WHERE id = 7");
    Ok(())
}

#[tokio::test]
async fn test_table_to_warehouse_upsert() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;

    warehouse
        .table_to_warehouse(
            &sales(),
            "public.sales",
            &LoadMode::Upsert {
                keys: vec!["id".to_string()],
            },
            None,
        )
        .await?;

    let statements = recorder.statements();
    assert_eq!(statements[0], "BEGIN");
    assert_eq!(
        statements[1],
        "CREATE TEMP TABLE sales_staging (LIKE public.sales)"
    );
    assert!(statements[2].starts_with("COPY sales_staging FROM 's3://scratch/"));
    assert_eq!(
        statements[3],
        "DELETE FROM public.sales USING sales_staging WHERE public.sales.id = sales_staging.id"
    );
    assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));

    let loads = recorder.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].0, "sales_staging");
    assert_eq!(loads[0].1.num_rows(), 3);

    assert_eq!(parquet_files(&dir.path().join("scratch")), 0);
    Ok(())
}

#[tokio::test]
async fn test_table_to_warehouse_bad_name_still_cleans_up() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_session, recorder, warehouse) = setup(dir.path()).await?;

    let err = warehouse
        .table_to_warehouse(&sales(), "sales", &LoadMode::Append, None)
        .await
        .expect_err("unqualified name");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(recorder.connection_counts(), (0, 0));
    assert_eq!(parquet_files(&dir.path().join("scratch")), 0);
    Ok(())
}
