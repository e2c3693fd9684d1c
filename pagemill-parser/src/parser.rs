use crate::grammar::{BatchfileParser, Rule};
use pagemill_core::{Batch, PagemillError, Result, Stage};
use pest::iterators::Pair;
use pest::Parser;
use std::path::PathBuf;

/// Parse a Batchfile string into a Batch
pub fn parse_batchfile(input: &str) -> Result<Batch> {
    let mut pairs = BatchfileParser::parse(Rule::file, input)
        .map_err(|e| PagemillError::ParseError(e.to_string()))?;

    let file = pairs
        .next()
        .ok_or_else(|| PagemillError::ParseError("No batch found in file".to_string()))?;
    let batch_pair = file
        .into_inner()
        .find(|pair| pair.as_rule() == Rule::batch)
        .ok_or_else(|| PagemillError::ParseError("No batch found in file".to_string()))?;

    parse_batch(batch_pair)
}

fn parse_batch(pair: Pair<Rule>) -> Result<Batch> {
    let mut name = String::new();
    let mut dir = None;
    let mut stages: Vec<Stage> = Vec::new();

    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::name_field => {
                name = field_string(inner_pair)?;
            }
            Rule::dir_field => {
                dir = Some(PathBuf::from(field_string(inner_pair)?));
            }
            Rule::stage => {
                let stage = parse_stage(inner_pair)?;
                if stages.iter().any(|s| s.name == stage.name) {
                    return Err(PagemillError::ParseError(format!(
                        "Duplicate stage name: {}",
                        stage.name
                    )));
                }
                stages.push(stage);
            }
            _ => {}
        }
    }

    Ok(Batch {
        name: if name.is_empty() { "default".to_string() } else { name },
        dir,
        stages,
    })
}

fn parse_stage(pair: Pair<Rule>) -> Result<Stage> {
    let mut name = String::new();
    let mut dir = None;
    let mut commands = Vec::new();
    let mut wait = true;

    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::string_literal => {
                name = unquote_string(inner_pair.as_str());
            }
            Rule::dir_field => {
                dir = Some(PathBuf::from(field_string(inner_pair)?));
            }
            Rule::run_field => {
                let line = field_string(inner_pair)?;
                if line.trim().is_empty() {
                    return Err(PagemillError::ParseError(format!(
                        "Empty run command in stage \"{}\"",
                        name
                    )));
                }
                commands.push(line);
            }
            Rule::wait_field => {
                wait = inner_pair
                    .into_inner()
                    .next()
                    .map(|b| b.as_str() == "true")
                    .unwrap_or(true);
            }
            _ => {}
        }
    }

    if name.trim().is_empty() {
        return Err(PagemillError::ParseError("Stage name must not be empty".to_string()));
    }

    Ok(Stage {
        name,
        dir,
        commands,
        wait,
    })
}

/// The string value of a `key: "value";` field
fn field_string(pair: Pair<Rule>) -> Result<String> {
    let rule = pair.as_rule();
    let value = pair
        .into_inner()
        .next()
        .ok_or_else(|| PagemillError::ParseError(format!("Missing value for {:?}", rule)))?;

    Ok(match value.as_rule() {
        Rule::multiline_string => unquote_multiline_string(value.as_str()),
        _ => unquote_string(value.as_str()),
    })
}

/// Strip the quotes and resolve `\"` and `\\`. Other escapes are kept as
/// written so shell backslashes survive.
fn unquote_string(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unquote_multiline_string(s: &str) -> String {
    s.strip_prefix("\"\"\"")
        .and_then(|s| s.strip_suffix("\"\"\""))
        .unwrap_or(s)
        .trim()
        .to_string()
}
