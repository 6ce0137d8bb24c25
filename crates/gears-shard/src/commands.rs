//! Admin command surface
//!
//! Commands arrive as argument vectors, the way the host store hands them
//! over. Plans and triggers travel as JSON.

use gears_core::{ExecutionId, GearsError, Record, RegistrationId, Result};
use gears_executor::{ExecutionMode, ExecutionOptions};
use gears_plan::Plan;
use gears_registry::Trigger;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum GearsCommand {
    /// `RG.EXECUTE <plan> [UNBLOCKING] [LOCAL] [ABORTONERROR] [MAXIDLE <ms>]`
    Execute {
        plan: Plan,
        unblocking: bool,
        options: ExecutionOptions,
    },
    GetExecution(ExecutionId),
    GetResults(ExecutionId),
    GetResultsBlocking(ExecutionId),
    DropExecution(ExecutionId),
    AbortExecution(ExecutionId),
    DumpExecutions,
    /// `RG.REGISTER <plan> <trigger> [MODE <mode>] [DESCRIPTION <text>]`
    Register {
        plan: Plan,
        trigger: Trigger,
        mode: ExecutionMode,
        description: Option<String>,
    },
    DumpRegistrations,
    PauseRegistrations(Vec<RegistrationId>),
    UnpauseRegistrations(Vec<RegistrationId>),
    Unregister {
        id: RegistrationId,
        abort_pending: bool,
    },
    ClearRegistrationsStats(Option<RegistrationId>),
    ConfigGet(Vec<String>),
    ConfigSet(Vec<(String, String)>),
    InfoCluster,
    /// `RG.TRIGGER <name> [args...]`
    Trigger { name: String, args: Vec<String> },
    /// Any other command goes to the keyspace, through command hooks
    Store(Vec<String>),
}

fn wrong_arity(command: &str) -> GearsError {
    GearsError::ExecutionError(format!("wrong number of arguments for '{}'", command))
}

fn single<'a>(command: &str, rest: &'a [String]) -> Result<&'a str> {
    match rest {
        [value] => Ok(value.as_str()),
        _ => Err(wrong_arity(command)),
    }
}

fn parse_mode(value: &str) -> Result<ExecutionMode> {
    match value.to_ascii_lowercase().as_str() {
        "sync" => Ok(ExecutionMode::Sync),
        "async" => Ok(ExecutionMode::Async),
        "async_local" | "asynclocal" => Ok(ExecutionMode::AsyncLocal),
        other => Err(GearsError::RegistrationError(format!(
            "unknown execution mode {}",
            other
        ))),
    }
}

impl GearsCommand {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Err(GearsError::ExecutionError("empty command".to_string()));
        };
        let upper = name.to_ascii_uppercase();
        let one_id = || single(name, rest);

        let command = match upper.as_str() {
            "RG.EXECUTE" => {
                let (plan, flags) = rest.split_first().ok_or_else(|| wrong_arity(name))?;
                let plan = Plan::from_json(plan)?;
                let mut unblocking = false;
                let mut options = ExecutionOptions::default();
                let mut flags = flags.iter();
                while let Some(flag) = flags.next() {
                    match flag.to_ascii_uppercase().as_str() {
                        "UNBLOCKING" => unblocking = true,
                        "LOCAL" => options.mode = ExecutionMode::AsyncLocal,
                        "ABORTONERROR" => options.abort_on_error = true,
                        "MAXIDLE" => {
                            let ms = flags
                                .next()
                                .and_then(|v| v.parse::<u64>().ok())
                                .ok_or_else(|| {
                                    GearsError::ExecutionError("MAXIDLE needs milliseconds".into())
                                })?;
                            options = options.with_max_idle(Duration::from_millis(ms));
                        }
                        other => {
                            return Err(GearsError::ExecutionError(format!(
                                "unknown argument {}",
                                other
                            )))
                        }
                    }
                }
                GearsCommand::Execute {
                    plan,
                    unblocking,
                    options,
                }
            }
            "RG.GETEXECUTION" => GearsCommand::GetExecution(one_id()?.parse()?),
            "RG.GETRESULTS" => GearsCommand::GetResults(one_id()?.parse()?),
            "RG.GETRESULTSBLOCKING" => GearsCommand::GetResultsBlocking(one_id()?.parse()?),
            "RG.DROPEXECUTION" => GearsCommand::DropExecution(one_id()?.parse()?),
            "RG.ABORTEXECUTION" => GearsCommand::AbortExecution(one_id()?.parse()?),
            "RG.DUMPEXECUTIONS" => GearsCommand::DumpExecutions,
            "RG.REGISTER" => {
                let [plan, trigger, options @ ..] = rest else {
                    return Err(wrong_arity(name));
                };
                let plan = Plan::from_json(plan)?;
                let trigger: Trigger = serde_json::from_str(trigger)?;
                let mut mode = ExecutionMode::Async;
                let mut description = None;
                let mut options = options.iter();
                while let Some(option) = options.next() {
                    let value = options.next().ok_or_else(|| wrong_arity(name))?;
                    match option.to_ascii_uppercase().as_str() {
                        "MODE" => mode = parse_mode(value)?,
                        "DESCRIPTION" => description = Some(value.clone()),
                        other => {
                            return Err(GearsError::RegistrationError(format!(
                                "unknown argument {}",
                                other
                            )))
                        }
                    }
                }
                GearsCommand::Register {
                    plan,
                    trigger,
                    mode,
                    description,
                }
            }
            "RG.DUMPREGISTRATIONS" => GearsCommand::DumpRegistrations,
            "RG.PAUSEREGISTRATIONS" | "RG.UNPAUSEREGISTRATIONS" => {
                if rest.is_empty() {
                    return Err(wrong_arity(name));
                }
                let ids = rest
                    .iter()
                    .map(|id| id.parse())
                    .collect::<Result<Vec<RegistrationId>>>()?;
                if upper == "RG.PAUSEREGISTRATIONS" {
                    GearsCommand::PauseRegistrations(ids)
                } else {
                    GearsCommand::UnpauseRegistrations(ids)
                }
            }
            "RG.UNREGISTER" => match rest {
                [id] => GearsCommand::Unregister {
                    id: id.parse()?,
                    abort_pending: false,
                },
                [id, flag] if flag.eq_ignore_ascii_case("ABORTPENDING") => {
                    GearsCommand::Unregister {
                        id: id.parse()?,
                        abort_pending: true,
                    }
                }
                _ => return Err(wrong_arity(name)),
            },
            "RG.CLEARREGISTRATIONSSTATS" => match rest {
                [] => GearsCommand::ClearRegistrationsStats(None),
                [id] => GearsCommand::ClearRegistrationsStats(Some(id.parse()?)),
                _ => return Err(wrong_arity(name)),
            },
            "RG.CONFIGGET" => {
                if rest.is_empty() {
                    return Err(wrong_arity(name));
                }
                GearsCommand::ConfigGet(rest.to_vec())
            }
            "RG.CONFIGSET" => {
                if rest.is_empty() || rest.len() % 2 != 0 {
                    return Err(wrong_arity(name));
                }
                GearsCommand::ConfigSet(
                    rest.chunks(2)
                        .map(|pair| (pair[0].clone(), pair[1].clone()))
                        .collect(),
                )
            }
            "RG.INFOCLUSTER" => GearsCommand::InfoCluster,
            "RG.TRIGGER" => {
                let (trigger, args) = rest.split_first().ok_or_else(|| wrong_arity(name))?;
                GearsCommand::Trigger {
                    name: trigger.clone(),
                    args: args.to_vec(),
                }
            }
            _ => GearsCommand::Store(args.to_vec()),
        };
        Ok(command)
    }
}

/// Reply to a command, shaped like the host store's replies
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommandReply {
    Ok,
    Nil,
    Int(i64),
    Str(String),
    Error(String),
    Array(Vec<CommandReply>),
}

impl CommandReply {
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => CommandReply::Str(json),
            Err(e) => CommandReply::Error(e.to_string()),
        }
    }

    pub fn record(record: &Record) -> Self {
        match record {
            Record::Null => CommandReply::Nil,
            Record::Int(i) => CommandReply::Int(*i),
            Record::Str(s) => CommandReply::Str(s.clone()),
            other => CommandReply::json(other),
        }
    }

    /// `[[results...], [errors...]]`
    pub fn results(records: &[Record], errors: &[String]) -> Self {
        CommandReply::Array(vec![
            CommandReply::Array(records.iter().map(CommandReply::record).collect()),
            CommandReply::Array(errors.iter().cloned().map(CommandReply::Str).collect()),
        ])
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CommandReply::Error(_))
    }
}

impl From<GearsError> for CommandReply {
    fn from(err: GearsError) -> Self {
        CommandReply::Error(err.to_string())
    }
}

impl<T: Into<CommandReply>> From<Result<T>> for CommandReply {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(e) => e.into(),
        }
    }
}

impl From<()> for CommandReply {
    fn from(_: ()) -> Self {
        CommandReply::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_plan::GearsBuilder;
    use gears_registry::KeyTrigger;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_execute_flags() {
        let plan = GearsBuilder::keys("*").count().build();
        let json = plan.to_json().unwrap();
        let cmd = GearsCommand::parse(&args(&["rg.execute", &json, "UNBLOCKING", "LOCAL"])).unwrap();
        match cmd {
            GearsCommand::Execute {
                plan: parsed,
                unblocking,
                options,
            } => {
                assert_eq!(parsed, plan);
                assert!(unblocking);
                assert_eq!(options.mode, ExecutionMode::AsyncLocal);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_register_with_options() {
        let plan = GearsBuilder::keys("*").build().to_json().unwrap();
        let trigger = serde_json::to_string(&Trigger::Keys(KeyTrigger::new("person:*"))).unwrap();
        let cmd = GearsCommand::parse(&args(&[
            "RG.REGISTER",
            &plan,
            &trigger,
            "MODE",
            "sync",
            "DESCRIPTION",
            "count people",
        ]))
        .unwrap();
        assert!(matches!(
            cmd,
            GearsCommand::Register {
                mode: ExecutionMode::Sync,
                description: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_parse_unregister_and_ids() {
        let cmd = GearsCommand::parse(&args(&["RG.UNREGISTER", "abc-3", "abortpending"])).unwrap();
        assert_eq!(
            cmd,
            GearsCommand::Unregister {
                id: "abc-3".parse().unwrap(),
                abort_pending: true
            }
        );
        assert!(GearsCommand::parse(&args(&["RG.GETEXECUTION", "no-id-here-x"])).is_err());
        assert!(GearsCommand::parse(&args(&["RG.CONFIGSET", "MaxExecutions"])).is_err());
        assert_eq!(
            GearsCommand::parse(&args(&["set", "k", "v"])).unwrap(),
            GearsCommand::Store(args(&["set", "k", "v"]))
        );
    }

    #[test]
    fn test_results_reply_shape() {
        let reply = CommandReply::results(&[Record::Int(3), Record::Null], &["boom".to_string()]);
        assert_eq!(
            reply,
            CommandReply::Array(vec![
                CommandReply::Array(vec![CommandReply::Int(3), CommandReply::Nil]),
                CommandReply::Array(vec![CommandReply::Str("boom".into())]),
            ])
        );
        let err: CommandReply = Err::<(), _>(GearsError::ConfigError("x".into())).into();
        assert!(err.is_error());
    }
}
