//! checkq CLI — operator interface to the checksheet queue.

use std::sync::Arc;

use checkq::config::Config;
use checkq::dispatch::Dispatcher;
use checkq::hub::{BroadcastHub, HubConfig};
use checkq::model::{NewControlPlan, PlanId, QueueFilter};
use checkq::queue::ControlPlanQueue;
use checkq::telemetry::init_tracing;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "checkq", about = "Checksheet queue coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a checksheet for a workcenter
    Enqueue {
        /// Tenant (PCID) the queue belongs to
        tenant: String,
        /// Workcenter key (also the broadcast channel)
        workcenter: String,
        /// Workcenter display code
        #[arg(long, default_value = "")]
        code: String,
        /// Control plan number
        #[arg(long)]
        control_plan_no: Option<String>,
        /// Part number
        #[arg(long)]
        part_no: Option<String>,
        /// Header note
        #[arg(long)]
        note: Option<String>,
    },
    /// List a tenant's queue
    List {
        tenant: String,
        /// Restrict to these workcenters
        #[arg(long)]
        workcenter: Vec<String>,
        /// Filter by active flag
        #[arg(long)]
        active: Option<bool>,
        /// Filter by complete flag
        #[arg(long)]
        complete: Option<bool>,
        /// Filter by skip flag
        #[arg(long)]
        skip: Option<bool>,
    },
    /// Show a checksheet
    Show {
        tenant: String,
        /// Checksheet ID (full UUID or prefix)
        id: String,
    },
    /// Mark the checksheet complete and promote the next in line
    Complete {
        tenant: String,
        id: String,
    },
    /// Skip the checksheet and promote the next in line
    Skip {
        tenant: String,
        id: String,
    },
    /// Rewrite the note on a checksheet header
    Note {
        tenant: String,
        id: String,
        note: String,
    },
    /// Delete aged-out inactive checksheets
    Purge {
        tenant: String,
        /// Retention window in days
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config.log_level)?;

    let queue = ControlPlanQueue::open(&config.database_path)?;
    let hub = Arc::new(BroadcastHub::new(HubConfig {
        heartbeat_interval: config.heartbeat_interval,
        stale_after: config.stale_after,
        ..HubConfig::default()
    }));
    let dispatcher = Dispatcher::new(queue, hub);

    match cli.command {
        Command::Enqueue {
            tenant,
            workcenter,
            code,
            control_plan_no,
            part_no,
            note,
        } => {
            let code = if code.is_empty() {
                workcenter.clone()
            } else {
                code
            };
            let mut new = NewControlPlan::new(&tenant, &workcenter, &code);
            if let Some(no) = control_plan_no {
                new = new.control_plan_no(no);
            }
            if let Some(no) = part_no {
                new = new.part_no(no);
            }
            if let Some(n) = note {
                new = new.note(n);
            }

            let plan = dispatcher.enqueue(new).await?;
            println!("Enqueued: {} (state: {})", plan.id, plan.state());
        }
        Command::List {
            tenant,
            workcenter,
            active,
            complete,
            skip,
        } => {
            let filter = QueueFilter {
                workcenter_keys: workcenter,
                active,
                complete,
                skip,
            };
            let plans = dispatcher.list_queue(&tenant, &filter)?;

            if plans.is_empty() {
                println!("No checksheets found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<12}  {:<9}  {:<12}  {:<12}  CREATED",
                "ID", "WORKCENTER", "STATE", "PLAN_NO", "PART_NO"
            );
            println!("{}", "-".repeat(80));
            for plan in &plans {
                println!(
                    "{:<8}  {:<12}  {:<9}  {:<12}  {:<12}  {}",
                    plan.id.to_string(),
                    plan.workcenter_key,
                    plan.state().to_string(),
                    plan.header.control_plan_no.as_deref().unwrap_or("-"),
                    plan.header.part_no.as_deref().unwrap_or("-"),
                    plan.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} checksheet(s)", plans.len());
        }
        Command::Show { tenant, id } => {
            let id = resolve_id(&dispatcher, &tenant, &id)?;
            let plan = dispatcher.get(id)?;
            println!("ID:          {}", plan.id.0);
            println!("Tenant:      {}", plan.tenant_id);
            println!("Workcenter:  {} ({})", plan.workcenter_key, plan.workcenter_code);
            println!("State:       {}", plan.state());
            println!(
                "Plan No:     {}",
                plan.header.control_plan_no.as_deref().unwrap_or("-")
            );
            println!(
                "Part No:     {}",
                plan.header.part_no.as_deref().unwrap_or("-")
            );
            println!("Note:        {}", plan.header.note.as_deref().unwrap_or("-"));
            println!("Created:     {}", plan.created_at);
            println!("Updated:     {}", plan.updated_at);
        }
        Command::Complete { tenant, id } => {
            let id = resolve_id(&dispatcher, &tenant, &id)?;
            match dispatcher.complete(id).await? {
                Some(next) => println!("Completed: {id}. Promoted: {}", next.id),
                None => println!("Completed: {id}. Queue empty."),
            }
        }
        Command::Skip { tenant, id } => {
            let id = resolve_id(&dispatcher, &tenant, &id)?;
            match dispatcher.skip(id).await? {
                Some(next) => println!("Skipped: {id}. Promoted: {}", next.id),
                None => println!("Skipped: {id}. Queue empty."),
            }
        }
        Command::Note { tenant, id, note } => {
            let id = resolve_id(&dispatcher, &tenant, &id)?;
            let plan = dispatcher.set_header_note(id, note)?;
            println!(
                "Updated note on {}: {}",
                plan.id,
                plan.header.note.as_deref().unwrap_or("-")
            );
        }
        Command::Purge { tenant, days } => {
            let deleted = dispatcher.purge(&tenant, chrono::Duration::days(days))?;
            println!("Purged {deleted} checksheet(s) older than {days} day(s).");
        }
    }

    Ok(())
}

/// Resolve a full UUID or a unique ID prefix within a tenant's queue.
fn resolve_id(dispatcher: &Dispatcher, tenant: &str, id_str: &str) -> anyhow::Result<PlanId> {
    if id_str.len() == 36 {
        return Ok(PlanId(uuid::Uuid::parse_str(id_str)?));
    }

    let plans = dispatcher.list_queue(tenant, &QueueFilter::default())?;
    let matches: Vec<_> = plans
        .iter()
        .filter(|p| p.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no checksheet matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} checksheets match prefix '{id_str}' — be more specific"),
    }
}
