use anyhow::Result;
use clap::{Parser, Subcommand};
use reviewflow::cli_style::{
    event_color, get_styles, print_colored_value, print_empty_list, print_error, print_info,
    print_key_value, print_list_item, print_section_footer, print_section_header, print_success,
    print_warning, status_color, TableBuilder,
};
use reviewflow::config::{AppConfig, CliConfig, FileConfig};
use reviewflow::workflow::{
    ActionId, ActionKind, ActionOutcome, BroadcastNotificationSink, ClaimedTask, CollectionId,
    FanoutNotificationSink, ItemId, NotificationSink, PoolTask, RoleName, SafetyDecision,
    SqliteWorkflowStore, StepId, TracingNotificationSink, WorkItem, WorkflowEngine,
    WorkflowError, WorkflowEvent, WorkflowRegistry,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_role(s: &str) -> Result<RoleName> {
    RoleName::parse(s)
}

#[derive(Parser, Debug)]
#[command(styles=get_styles(), version, about = "Review workflow administration")]
struct CliArgs {
    /// Path to the SQLite workflow database file.
    /// Looks for reviewflow.db in the current directory and its parents if omitted.
    #[clap(long, global = true, value_parser = parse_path)]
    pub db: Option<PathBuf>,

    /// Path to the workflow definitions TOML file.
    #[clap(long, global = true, value_parser = parse_path)]
    pub workflows: Option<PathBuf>,

    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Capacity of the event channel used to report transitions.
    #[clap(long, global = true)]
    pub notification_buffer: Option<usize>,

    /// Print results as JSON.
    #[clap(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates an identity with the given handle.
    AddIdentity { handle: String },

    /// Deletes an identity, unless a task in review still depends on it.
    DeleteIdentity { handle: String },

    /// Lists the kinds of tasks that keep an identity from being deleted.
    DeleteConstraints { handle: String },

    /// Adds an identity to the role group of a collection.
    AddMember {
        collection: String,
        #[clap(value_parser = parse_role)]
        role: RoleName,
        handle: String,
    },

    /// Removes an identity from the role group of a collection.
    RemoveMember {
        collection: String,
        #[clap(value_parser = parse_role)]
        role: RoleName,
        handle: String,
    },

    /// Tells whether removing a member would be refused, without removing it.
    CanRemoveMember {
        collection: String,
        #[clap(value_parser = parse_role)]
        role: RoleName,
        handle: String,
    },

    /// Shows the members of a role group.
    Members {
        collection: String,
        #[clap(value_parser = parse_role)]
        role: RoleName,
    },

    /// Puts a new work item into review.
    Submit {
        collection: String,
        /// Handle of the submitting identity.
        #[clap(long)]
        submitter: Option<String>,
    },

    /// Performs a workflow action on a work item.
    Act {
        item_id: ItemId,
        handle: String,
        step: String,
        action: String,
    },

    /// Withdraws a work item from review, dropping its task.
    Abort { item_id: ItemId },

    /// Shows the pooled and claimed tasks of an identity.
    Tasks { handle: String },

    /// Shows a work item and its task.
    Item { item_id: ItemId },

    /// Shows the transitions of a work item.
    History { item_id: ItemId },

    /// Lists items waiting at a step whose role group is empty.
    Parked,

    /// Lists every role group with its member ids.
    Groups,

    /// Shows the configured workflows.
    Workflows,
}

fn main() -> ExitCode {
    let cli_args = CliArgs::parse();

    // Logs go to stderr, stdout is for results
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    match run(cli_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<WorkflowError>() {
            Some(workflow_error) => {
                report_workflow_error(workflow_error);
                ExitCode::from(workflow_error.exit_code() as u8)
            }
            None => {
                print_error(&format!("{:#}", err));
                ExitCode::FAILURE
            }
        },
    }
}

fn report_workflow_error(err: &WorkflowError) {
    match err {
        WorkflowError::Refused(refusal) => {
            print_error(&format!("Refused for identity {}:", refusal.identity));
            for blocker in &refusal.blockers {
                eprintln!("    - [item {}] {}", blocker.item_id(), blocker);
            }
            print_warning("Add a replacement member or finish the tasks, then retry.");
        }
        other => print_error(&other.to_string()),
    }
}

fn run(cli_args: CliArgs) -> Result<()> {
    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_path: cli_args.db.clone().or_else(SqliteWorkflowStore::infer_path),
        workflows_path: cli_args.workflows.clone(),
        notification_buffer: cli_args.notification_buffer,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let registry = WorkflowRegistry::load(&config.workflows_path)?;
    info!("Opening workflow database at {:?}...", config.db_path);
    let store = SqliteWorkflowStore::new(&config.db_path)?;

    let broadcast_sink = Arc::new(BroadcastNotificationSink::new(config.notifications.buffer));
    let events_rx = broadcast_sink.subscribe();
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(broadcast_sink)];
    if config.notifications.log_events {
        sinks.push(Box::new(TracingNotificationSink));
    }

    let engine = WorkflowEngine::new(
        Arc::new(store),
        Arc::new(registry),
        Arc::new(FanoutNotificationSink::new(sinks)),
    )?;

    execute_command(&engine, cli_args.command, cli_args.json)?;
    if !cli_args.json {
        print_events(events_rx);
    }
    Ok(())
}

fn print_events(mut rx: broadcast::Receiver<WorkflowEvent>) {
    while let Ok(event) = rx.try_recv() {
        let from = event.from_step.as_ref().map(StepId::as_str).unwrap_or("-");
        let to = event.to_step.as_ref().map(StepId::as_str).unwrap_or("-");
        print_colored_value(
            &format!("item {}", event.item_id),
            &format!("{} ({} -> {})", event.kind, from, to),
            event_color(event.kind),
        );
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_item(item: &WorkItem) {
    print_section_header(&format!("Work item {}", item.id));
    print_key_value("Collection", item.collection.as_str());
    print_colored_value("Status", item.status.as_str(), status_color(item.status));
    print_key_value(
        "Current step",
        item.current_step.as_ref().map(StepId::as_str).unwrap_or("-"),
    );
    print_key_value(
        "Submitter",
        &item
            .submitter
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    print_section_footer();
}

#[derive(Serialize)]
struct ActionView {
    id: String,
    kind: String,
}

#[derive(Serialize)]
struct StepView {
    id: String,
    role: String,
    actions: Vec<ActionView>,
}

#[derive(Serialize)]
struct WorkflowView {
    id: String,
    steps: Vec<StepView>,
}

#[derive(Serialize)]
struct WorkflowsOverview {
    workflows: Vec<WorkflowView>,
    /// Collection handle to workflow id, sorted by collection.
    collections: BTreeMap<String, String>,
}

fn describe_action(kind: &ActionKind) -> String {
    match kind {
        ActionKind::Claim => "claim".to_string(),
        ActionKind::Release => "release".to_string(),
        ActionKind::Complete(ActionOutcome::Advance) => "advance".to_string(),
        ActionKind::Complete(ActionOutcome::ReturnTo(target)) => format!("return to {}", target),
        ActionKind::Complete(ActionOutcome::ReturnToSubmitter) => "return to submitter".to_string(),
    }
}

fn execute_command(engine: &WorkflowEngine, command: Command, json: bool) -> Result<()> {
    match command {
        Command::AddIdentity { handle } => {
            let id = engine.add_identity(&handle)?;
            emit(json, &id, |id| {
                print_success(&format!("Created identity {} with id {}", handle, id))
            })?;
        }
        Command::DeleteIdentity { handle } => {
            let identity = engine.identity_by_handle(&handle)?;
            engine.delete_identity(identity.id)?;
            emit(json, &identity, |identity| {
                print_success(&format!("Deleted identity {}", identity.handle))
            })?;
        }
        Command::DeleteConstraints { handle } => {
            let identity = engine.identity_by_handle(&handle)?;
            let constraints = engine.delete_constraints(identity.id)?;
            emit(json, &constraints, |constraints| {
                if constraints.is_empty() {
                    print_empty_list("No task references this identity");
                }
                for constraint in constraints {
                    print_list_item(constraint.as_str(), 1);
                }
            })?;
        }
        Command::AddMember {
            collection,
            role,
            handle,
        } => {
            let identity = engine.identity_by_handle(&handle)?;
            let added = engine.add_member(&CollectionId(collection.clone()), &role, identity.id)?;
            emit(json, &added, |added| {
                if *added {
                    print_success(&format!("Added {} as {} of {}", handle, role, collection));
                } else {
                    print_info(&format!("{} already is {} of {}", handle, role, collection));
                }
            })?;
        }
        Command::RemoveMember {
            collection,
            role,
            handle,
        } => {
            let identity = engine.identity_by_handle(&handle)?;
            let removed =
                engine.remove_member(&CollectionId(collection.clone()), &role, identity.id)?;
            emit(json, &removed, |removed| {
                if *removed {
                    print_success(&format!("Removed {} from {} of {}", handle, role, collection));
                } else {
                    print_info(&format!("{} is not {} of {}", handle, role, collection));
                }
            })?;
        }
        Command::CanRemoveMember {
            collection,
            role,
            handle,
        } => {
            let identity = engine.identity_by_handle(&handle)?;
            let decision =
                engine.can_remove_member(&CollectionId(collection), &role, identity.id)?;
            emit(json, &decision, |decision| match decision {
                SafetyDecision::Allowed => print_success("Removal would be allowed"),
                SafetyDecision::Refused(refusal) => {
                    print_warning("Removal would be refused:");
                    for blocker in &refusal.blockers {
                        print_list_item(&blocker.to_string(), 1);
                    }
                }
            })?;
        }
        Command::Members { collection, role } => {
            let members = engine.members(&CollectionId(collection.clone()), &role)?;
            emit(json, &members, |members| {
                print_section_header(&format!("{} of {}", role, collection));
                if members.is_empty() {
                    print_empty_list("No members");
                }
                for member in members {
                    print_list_item(&format!("{} (id {})", member.handle, member.id), 1);
                }
                print_section_footer();
            })?;
        }
        Command::Submit {
            collection,
            submitter,
        } => {
            let submitter = submitter
                .map(|handle| engine.identity_by_handle(&handle))
                .transpose()?
                .map(|identity| identity.id);
            let item_id = engine.submit(&CollectionId(collection), submitter)?;
            let item = engine.get_item(item_id)?;
            emit(json, &item, print_item)?;
        }
        Command::Act {
            item_id,
            handle,
            step,
            action,
        } => {
            let identity = engine.identity_by_handle(&handle)?;
            let item = engine.perform_action(
                item_id,
                identity.id,
                &StepId(step),
                &ActionId(action),
            )?;
            emit(json, &item, print_item)?;
        }
        Command::Abort { item_id } => {
            let item = engine.abort(item_id)?;
            emit(json, &item, print_item)?;
        }
        Command::Tasks { handle } => {
            let identity = engine.identity_by_handle(&handle)?;
            #[derive(Serialize)]
            struct Tasks {
                pooled: Vec<PoolTask>,
                claimed: Vec<ClaimedTask>,
            }
            let tasks = Tasks {
                pooled: engine.pool_tasks_for(identity.id)?,
                claimed: engine.claimed_tasks_of(identity.id)?,
            };
            emit(json, &tasks, |tasks| {
                let mut table = TableBuilder::new(vec!["Item", "Collection", "Step", "State"]);
                for task in &tasks.claimed {
                    table.add_row(vec![
                        task.item_id.to_string(),
                        task.collection.to_string(),
                        task.step.to_string(),
                        "claimed".to_string(),
                    ]);
                }
                for task in &tasks.pooled {
                    table.add_row(vec![
                        task.item_id.to_string(),
                        task.collection.to_string(),
                        task.step.to_string(),
                        "pooled".to_string(),
                    ]);
                }
                if table.is_empty() {
                    print_empty_list(&format!("No tasks for {}", handle));
                } else {
                    table.print();
                }
            })?;
        }
        Command::Item { item_id } => {
            let item = engine.get_item(item_id)?;
            let claimed = engine.claimed_task_of_item(item_id)?;
            let pooled = engine.pool_tasks_of_item(item_id)?;
            if json {
                #[derive(Serialize)]
                struct ItemView<'a> {
                    item: &'a WorkItem,
                    claimed_by: Option<usize>,
                    pooled_for: Vec<usize>,
                }
                emit(
                    json,
                    &ItemView {
                        item: &item,
                        claimed_by: claimed.map(|c| c.owner),
                        pooled_for: pooled.iter().map(|p| p.member).collect(),
                    },
                    |_| {},
                )?;
            } else {
                print_item(&item);
                if let Some(claimed) = claimed {
                    print_key_value("Claimed by", &claimed.owner.to_string());
                } else if item.is_in_review() {
                    let members: Vec<String> =
                        pooled.iter().map(|p| p.member.to_string()).collect();
                    print_key_value("Pooled for", &members.join(", "));
                }
            }
        }
        Command::History { item_id } => {
            let events = engine.item_history(item_id)?;
            emit(json, &events, |events| {
                let mut table = TableBuilder::new(vec!["Event", "From", "To", "Action", "Actor"]);
                for event in events {
                    table.add_row(vec![
                        event.kind.to_string(),
                        event.from_step.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                        event.to_step.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                        event.action.as_ref().map(|a| a.to_string()).unwrap_or_default(),
                        event.actor.map(|a| a.to_string()).unwrap_or_default(),
                    ]);
                }
                table.print();
            })?;
        }
        Command::Parked => {
            let parked = engine.parked_items()?;
            emit(json, &parked, |parked| {
                if parked.is_empty() {
                    print_empty_list("No parked items");
                }
                for item in parked {
                    print_list_item(
                        &format!(
                            "item {} in {} at {}",
                            item.id,
                            item.collection,
                            item.current_step.as_ref().map(StepId::as_str).unwrap_or("-")
                        ),
                        1,
                    );
                }
            })?;
        }
        Command::Groups => {
            let groups = engine.role_groups()?;
            emit(json, &groups, |groups| {
                let mut table = TableBuilder::new(vec!["Collection", "Role", "Members"]);
                for group in groups {
                    let members: Vec<String> =
                        group.members.iter().map(|m| m.to_string()).collect();
                    table.add_row(vec![
                        group.collection.to_string(),
                        group.role.to_string(),
                        members.join(", "),
                    ]);
                }
                if table.is_empty() {
                    print_empty_list("No role groups");
                } else {
                    table.print();
                }
            })?;
        }
        Command::Workflows => {
            let registry = engine.registry();
            let mut workflows: Vec<WorkflowView> = registry
                .workflows()
                .map(|workflow| WorkflowView {
                    id: workflow.id.to_string(),
                    steps: workflow
                        .steps
                        .iter()
                        .map(|step| StepView {
                            id: step.id.to_string(),
                            role: step.role.to_string(),
                            actions: step
                                .actions
                                .iter()
                                .map(|action| ActionView {
                                    id: action.id.to_string(),
                                    kind: describe_action(&action.kind),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect();
            workflows.sort_by(|a, b| a.id.cmp(&b.id));
            let overview = WorkflowsOverview {
                workflows,
                collections: registry
                    .collections()
                    .map(|(collection, workflow)| (collection.to_string(), workflow.id.to_string()))
                    .collect(),
            };

            emit(json, &overview, |overview| {
                for workflow in &overview.workflows {
                    print_section_header(&format!("Workflow {}", workflow.id));
                    for step in &workflow.steps {
                        print_list_item(&format!("{} ({})", step.id, step.role), 1);
                        for action in &step.actions {
                            print_list_item(&format!("{}: {}", action.id, action.kind), 2);
                        }
                    }
                    print_section_footer();
                }
                for (collection, workflow) in &overview.collections {
                    print_key_value(collection, workflow);
                }
            })?;
        }
    }
    Ok(())
}
