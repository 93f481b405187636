//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    engines::{EngineOutput, replay::Recording},
    prelude::*,
    queues::{
        documents::{DocumentInput, DocumentOutput},
        work::{WorkInput, WorkOutput},
    },
    review::ReviewTicket,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// A document to process.
    DocumentInput,
    /// Where a document ended up.
    DocumentOutput,
    /// A manual-review ticket.
    ReviewTicket,
    /// What `command` engines print on stdout.
    EngineOutput,
    /// A recorded capture for `replay` engines.
    Recording,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::DocumentInput => schema_for!(WorkInput<DocumentInput>),
        SchemaType::DocumentOutput => schema_for!(WorkOutput<DocumentOutput>),
        SchemaType::ReviewTicket => schema_for!(ReviewTicket),
        SchemaType::EngineOutput => schema_for!(EngineOutput),
        SchemaType::Recording => schema_for!(Recording),
    };

    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
