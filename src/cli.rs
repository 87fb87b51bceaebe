//! Operator console: a stdin/stdout command loop over the task catalog and
//! the dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::catalog::TaskCatalog;
use crate::error::{CommandError, Result};
use crate::scheduler::Dispatcher;
use crate::show::{StatusRow, render_table};
use crate::task::{JobKind, TaskSchedule};

const HELP: &str = "\
Commands:
  create <name> <db> <kind> <sql...>   define a task (kind: sql, statistics, mv_refresh)
  schedule <name> <cron...|manual>     set a task's schedule
  run <name> [priority=N] [k=v ...]    submit a run of a task
  priority <query_id> <n>              change a queued run's priority
  cancel <query_id>                    cancel a queued or running run
  show                                 list runs, newest first
  tasks                                list tasks
  quit                                 stop the scheduler";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create {
        name: String,
        db: String,
        kind: JobKind,
        definition: String,
    },
    Schedule {
        name: String,
        schedule: TaskSchedule,
    },
    Run {
        name: String,
        priority: Option<i32>,
        properties: BTreeMap<String, String>,
    },
    Priority {
        query_id: String,
        priority: i32,
    },
    Cancel {
        query_id: String,
    },
    Show,
    Tasks,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(CommandError::Usage("help").into());
        };
        let rest: Vec<&str> = words.collect();

        let command = match verb.to_ascii_lowercase().as_str() {
            "create" => {
                let [name, db, kind, sql @ ..] = rest.as_slice() else {
                    return Err(CommandError::Usage("create <name> <db> <kind> <sql...>").into());
                };
                if sql.is_empty() {
                    return Err(CommandError::Usage("create <name> <db> <kind> <sql...>").into());
                }
                Command::Create {
                    name: name.to_string(),
                    db: db.to_string(),
                    kind: kind.parse()?,
                    definition: sql.join(" "),
                }
            }
            "schedule" => {
                let [name, expression @ ..] = rest.as_slice() else {
                    return Err(CommandError::Usage("schedule <name> <cron...|manual>").into());
                };
                let schedule = match expression {
                    [] => return Err(CommandError::Usage("schedule <name> <cron...|manual>").into()),
                    [word] if word.eq_ignore_ascii_case("manual") => TaskSchedule::Manual,
                    _ => TaskSchedule::periodic(expression.join(" "))?,
                };
                Command::Schedule {
                    name: name.to_string(),
                    schedule,
                }
            }
            "run" => {
                let [name, options @ ..] = rest.as_slice() else {
                    return Err(CommandError::Usage("run <name> [priority=N] [k=v ...]").into());
                };
                let mut priority = None;
                let mut properties = BTreeMap::new();
                for option in options {
                    let Some((key, value)) = option.split_once('=') else {
                        return Err(CommandError::InvalidArgument {
                            name: "property",
                            value: option.to_string(),
                        }
                        .into());
                    };
                    if key.eq_ignore_ascii_case("priority") {
                        priority = Some(parse_priority(value)?);
                    } else {
                        properties.insert(key.to_string(), value.to_string());
                    }
                }
                Command::Run {
                    name: name.to_string(),
                    priority,
                    properties,
                }
            }
            "priority" => {
                let [query_id, priority] = rest.as_slice() else {
                    return Err(CommandError::Usage("priority <query_id> <n>").into());
                };
                Command::Priority {
                    query_id: query_id.to_string(),
                    priority: parse_priority(priority)?,
                }
            }
            "cancel" => {
                let [query_id] = rest.as_slice() else {
                    return Err(CommandError::Usage("cancel <query_id>").into());
                };
                Command::Cancel {
                    query_id: query_id.to_string(),
                }
            }
            "show" => Command::Show,
            "tasks" => Command::Tasks,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string()).into()),
        };
        Ok(command)
    }
}

fn parse_priority(value: &str) -> std::result::Result<i32, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidArgument {
        name: "priority",
        value: value.to_string(),
    })
}

/// What the console says back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

pub struct Console {
    catalog: Arc<TaskCatalog>,
    dispatcher: Arc<Dispatcher>,
}

impl Console {
    pub fn new(catalog: Arc<TaskCatalog>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            catalog,
            dispatcher,
        }
    }

    pub async fn handle_line(&self, line: &str) -> Result<Reply> {
        self.execute(Command::parse(line)?).await
    }

    pub async fn execute(&self, command: Command) -> Result<Reply> {
        let text = match command {
            Command::Create {
                name,
                db,
                kind,
                definition,
            } => {
                let task = self.catalog.create(&name, &db, kind, &definition).await?;
                format!("Created task {} (id {})", task.name, task.id)
            }
            Command::Schedule { name, schedule } => {
                let task = self.catalog.set_schedule(&name, schedule).await?;
                match task.schedule.next_fire_time() {
                    Some(at) => format!("Task {name} next fires at {}", at.format("%Y-%m-%d %H:%M:%S")),
                    None => format!("Task {name} is manual"),
                }
            }
            Command::Run {
                name,
                priority,
                properties,
            } => {
                let task = self.catalog.get(&name).await?;
                let mut run = self.dispatcher.create_run(task, properties).await?;
                if let (Some(priority), Some(status)) = (priority, run.status_mut()) {
                    status.set_priority(priority);
                }
                let handle = self.dispatcher.submit(run).await?;
                format!("Submitted {}", handle.query_id())
            }
            Command::Priority { query_id, priority } => {
                self.dispatcher.set_priority(&query_id, priority).await?;
                format!("Run {query_id} priority set to {priority}")
            }
            Command::Cancel { query_id } => {
                if self.dispatcher.cancel(&query_id).await {
                    format!("Cancelled {query_id}")
                } else {
                    format!("No live run {query_id}")
                }
            }
            Command::Show => {
                let mut rows = Vec::new();
                for status in self.dispatcher.history().list().await {
                    let task = self.catalog.find(status.task_name()).await;
                    rows.push(StatusRow::from_run(task.as_deref(), &status));
                }
                render_table(&rows)
            }
            Command::Tasks => self
                .catalog
                .list()
                .await
                .iter()
                .map(|t| {
                    format!(
                        "{} {} {} {} {}",
                        t.id,
                        t.name,
                        t.db_name,
                        t.kind,
                        t.schedule.schedule_type()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Help => HELP.to_string(),
            Command::Quit => return Ok(Reply::Quit),
        };
        Ok(Reply::Text(text))
    }
}

/// Read commands from stdin until `quit` or EOF.
pub async fn run_repl(console: &Console) -> std::io::Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let mut lines = reader.lines();

    eprint!("> ");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }
        match console.handle_line(line).await {
            Ok(Reply::Text(text)) => println!("{text}"),
            Ok(Reply::Quit) => break,
            Err(e) => eprintln!("error: {e}"),
        }
        eprint!("> ");
    }
    Ok(())
}
