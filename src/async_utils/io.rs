//! Output utilities.
//!
//! Reports go to a file or standard output, as JSONL by default or as CSV.
//! Both writers take a plain slice, because a search batch is capped at a few
//! hundred records and is fully materialized by the time we report on it.

use clap::ValueEnum;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Output formats for reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    /// Comma-separated values with a header row.
    Csv,
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write records to either standard output or a file, in the requested format.
pub async fn write_output<T>(
    path: Option<&Path>,
    format: OutputFormat,
    records: &[T],
) -> Result<()>
where
    T: Serialize,
{
    let writer = create_writer(path).await?;
    match format {
        OutputFormat::Jsonl => write_jsonl(writer, records).await,
        OutputFormat::Csv => write_csv(writer, records).await,
    }
}

/// Write records as JSONL.
async fn write_jsonl<W, T>(writer: W, records: &[T]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut writer = BufWriter::new(writer);
    for record in records {
        let json =
            serde_json::to_string(record).context("Failed to serialize JSON record")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write records as CSV. Fields must be scalars.
async fn write_csv<W, T>(writer: W, records: &[T]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut serializer = csv_async::AsyncSerializer::from_writer(writer);
    for record in records {
        serializer
            .serialize(record)
            .await
            .context("Failed to write CSV record")?;
    }
    serializer.flush().await.context("Failed to flush CSV output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        id: u32,
        text: Option<String>,
    }

    fn rows() -> Vec<Row> {
        vec![
            Row {
                id: 1,
                text: Some("hello, world".to_owned()),
            },
            Row { id: 2, text: None },
        ]
    }

    #[tokio::test]
    async fn test_write_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        write_output(Some(&path), OutputFormat::Jsonl, &rows())
            .await
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"text\":\"hello, world\"}\n{\"id\":2,\"text\":null}\n"
        );
    }

    #[tokio::test]
    async fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_output(Some(&path), OutputFormat::Csv, &rows())
            .await
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "id,text\n1,\"hello, world\"\n2,\n");
    }
}
