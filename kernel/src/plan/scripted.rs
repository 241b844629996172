// Scripted Engine
//
// A minimal engine driving the control plane from `;`-separated
// directives. Used by the CLI and by tests; it is not a DDL language.
//
//   apply <topology|table|security> <text>   append a metadata change
//   sleep <ms>                               wait, checking for cancellation
//   fail <message>                           fail the plan
//   invariant <message>                      report an internal engine error
//   panic <message>                          panic inside the engine

use std::time::Duration;

use crate::metadata::MetadataType;
use crate::plan::engine::{EngineError, ExecutionContext, StatementEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Apply(MetadataType, String),
    Sleep(Duration),
    Fail(String),
    Invariant(String),
    Panic(String),
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    /// Longest stretch a `sleep` runs without a cancellation checkpoint.
    slice: Duration,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            slice: Duration::from_millis(5),
        }
    }

    pub fn with_slice(slice: Duration) -> Self {
        Self { slice }
    }

    fn parse_directive(text: &str) -> Result<Directive, EngineError> {
        let (verb, rest) = match text.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (text, ""),
        };

        match verb.to_ascii_lowercase().as_str() {
            "apply" => {
                let (kind, payload) = rest
                    .split_once(char::is_whitespace)
                    .map(|(kind, payload)| (kind, payload.trim()))
                    .unwrap_or((rest, ""));
                let metadata_type = kind
                    .parse::<MetadataType>()
                    .map_err(|e| EngineError::Malformed(e.to_string()))?;
                if payload.is_empty() {
                    return Err(EngineError::Malformed(format!(
                        "apply {metadata_type} requires a change"
                    )));
                }
                Ok(Directive::Apply(metadata_type, payload.to_string()))
            }
            "sleep" => rest
                .parse::<u64>()
                .map(|ms| Directive::Sleep(Duration::from_millis(ms)))
                .map_err(|_| EngineError::Malformed(format!("invalid sleep duration `{rest}`"))),
            "fail" => Ok(Directive::Fail(rest.to_string())),
            "invariant" => Ok(Directive::Invariant(rest.to_string())),
            "panic" => Ok(Directive::Panic(rest.to_string())),
            other => Err(EngineError::Malformed(format!("unknown directive `{other}`"))),
        }
    }

    fn sleep(&self, total: Duration, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let mut remaining = total;
        while !remaining.is_zero() {
            ctx.checkpoint()?;
            let step = remaining.min(self.slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        Ok(())
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementEngine for ScriptedEngine {
    type Prepared = Vec<Directive>;

    fn prepare(&self, statement: &str) -> Result<Self::Prepared, EngineError> {
        let directives = statement
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse_directive)
            .collect::<Result<Vec<_>, _>>()?;

        if directives.is_empty() {
            return Err(EngineError::Malformed("empty statement".into()));
        }
        Ok(directives)
    }

    fn run(&self, prepared: Self::Prepared, ctx: &ExecutionContext) -> Result<(), EngineError> {
        for directive in prepared {
            ctx.checkpoint()?;
            match directive {
                Directive::Apply(metadata_type, change) => {
                    ctx.store().apply_change(metadata_type, change.into_bytes());
                }
                Directive::Sleep(duration) => self.sleep(duration, ctx)?,
                Directive::Fail(message) => return Err(EngineError::Failed(message)),
                Directive::Invariant(message) => {
                    return Err(EngineError::Internal {
                        message,
                        context: format!("scripted engine, plan {}", ctx.plan_id()),
                    })
                }
                Directive::Panic(message) => panic!("{message}"),
            }
        }
        ctx.checkpoint()
    }
}
