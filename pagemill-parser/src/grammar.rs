use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "batchfile.pest"]
pub(crate) struct BatchfileParser;
