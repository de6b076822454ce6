use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use dosewatch_core::store::{active_medicines, events_for_day};
use dosewatch_core::*;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dosewatch")]
#[command(about = "Medication schedule and missed-dose tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Act as this user (defaults to [session] user in the config)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Pin the clock to an RFC 3339 instant instead of the system time
    #[arg(long, global = true, value_parser = parse_now)]
    now: Option<DateTime<FixedOffset>>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage medicines
    Medicine {
        #[command(subcommand)]
        command: MedicineCommands,
    },

    /// Record a dose as taken (or explicitly missed)
    Log {
        medicine_id: Uuid,

        /// Scheduled dose time, HH:MM
        #[arg(value_parser = parse_time)]
        time: NaiveTime,

        /// Record the dose as missed instead of taken
        #[arg(long)]
        missed: bool,
    },

    /// Reconcile missed doses and show today's adherence
    Status,

    /// Keep reconciling on a timer, printing adherence when it changes
    Watch {
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u32>,

        /// Seconds between ticks (defaults to [schedule] tick_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Delete dose events older than the retention window
    Purge,

    /// Append the user's dose history to a CSV file
    Export { path: PathBuf },
}

#[derive(Subcommand)]
enum MedicineCommands {
    /// Add a medicine with its daily dose times
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        dosage: String,

        #[arg(long)]
        purpose: Option<String>,

        /// Free-form note such as "after food"
        #[arg(long)]
        timing: Option<String>,

        /// Dose times, HH:MM, comma separated
        #[arg(long, required = true, value_delimiter = ',', value_parser = parse_time)]
        times: Vec<NaiveTime>,

        /// First day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day (YYYY-MM-DD), defaults to 30 days after the first
        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// List the user's medicines
    List,

    /// Delete a medicine and its dose history
    Remove { id: Uuid },

    /// Stop a medicine from today, keeping its history
    Deactivate { id: Uuid },
}

fn parse_now(input: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(input).map_err(|e| format!("invalid RFC 3339 time: {}", e))
}

fn parse_time(input: &str) -> std::result::Result<NaiveTime, String> {
    schedule::parse_time_of_day(input).map_err(|e| e.to_string())
}

struct Context<C> {
    config: Config,
    store: FileStore,
    user: Option<UserId>,
    clock: C,
}

impl<C: Clock> Context<C> {
    fn require_user(&self) -> Result<UserId> {
        self.user.clone().ok_or_else(|| {
            Error::InvalidInput("no user selected: pass --user or set [session] user".into())
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        dosewatch_core::logging::init_with_level("debug");
    } else {
        dosewatch_core::logging::init();
    }

    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    let store = FileStore::open(config.store_path())?;
    let user = cli
        .user
        .map(UserId::new)
        .or_else(|| config.session.user.clone());
    // Unpinned runs follow the system zone so days roll over at local midnight
    match cli.now {
        Some(now) => run(
            cli.command,
            Context {
                config,
                store,
                user,
                clock: FixedClock::new(now),
            },
        ),
        None => run(
            cli.command,
            Context {
                config,
                store,
                user,
                clock: SystemClock,
            },
        ),
    }
}

fn run<C: Clock + 'static>(command: Commands, ctx: Context<C>) -> Result<()> {
    match command {
        Commands::Medicine { command } => match command {
            MedicineCommands::Add {
                name,
                dosage,
                purpose,
                timing,
                times,
                start,
                end,
            } => cmd_medicine_add(ctx, name, dosage, purpose, timing, times, start, end),
            MedicineCommands::List => cmd_medicine_list(ctx),
            MedicineCommands::Remove { id } => cmd_medicine_remove(ctx, id),
            MedicineCommands::Deactivate { id } => cmd_medicine_deactivate(ctx, id),
        },
        Commands::Log {
            medicine_id,
            time,
            missed,
        } => cmd_log(ctx, medicine_id, time, !missed),
        Commands::Status => cmd_status(ctx),
        Commands::Watch { ticks, interval } => cmd_watch(ctx, ticks, interval),
        Commands::Purge => cmd_purge(ctx),
        Commands::Export { path } => cmd_export(ctx, path),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_medicine_add<C: Clock>(
    mut ctx: Context<C>,
    name: String,
    dosage: String,
    purpose: Option<String>,
    timing: Option<String>,
    times: Vec<NaiveTime>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<()> {
    let user = ctx.require_user()?;
    let start = start.unwrap_or_else(|| ctx.clock.now().date_naive());
    let end = end.unwrap_or(start + ChronoDuration::days(30));

    let mut medicine = times
        .into_iter()
        .fold(Medicine::new(user, name, dosage, start, end), |med, t| {
            med.with_dose(t)
        });
    if let Some(purpose) = purpose {
        medicine = medicine.with_purpose(purpose);
    }
    if let Some(timing) = timing {
        medicine = medicine.with_timing(timing);
    }

    let medicine = actions::add_medicine(&mut ctx.store, medicine)?;

    println!("✓ Added {} {}", medicine.name, medicine.dosage);
    println!("  id: {}", medicine.id);
    println!("  {}: {}", medicine.display_timing_frequency(), format_times(&medicine));
    Ok(())
}

fn cmd_medicine_list<C: Clock>(ctx: Context<C>) -> Result<()> {
    let user = ctx.require_user()?;
    let now = ctx.clock.now();
    let medicines = ctx.store.medicines_for_user(&user)?;

    if medicines.is_empty() {
        println!("No medicines for {}.", user);
        return Ok(());
    }

    for medicine in &medicines {
        let state = if !medicine.is_active {
            "inactive"
        } else if medicine.is_future_medicine(&now) {
            "upcoming"
        } else if medicine.has_period_ended(&now) {
            "ended"
        } else {
            "active"
        };
        println!(
            "{}  {} {} [{}]  {}",
            medicine.id,
            medicine.name,
            medicine.dosage,
            state,
            format_times(medicine)
        );
        if !medicine.purpose.is_empty() {
            println!("    for {}", medicine.purpose);
        }
    }
    Ok(())
}

fn cmd_medicine_remove<C: Clock>(mut ctx: Context<C>, id: Uuid) -> Result<()> {
    let user = ctx.require_user()?;
    actions::remove_medicine(&mut ctx.store, &user, id)?;
    println!("✓ Removed medicine {}", id);
    Ok(())
}

fn cmd_medicine_deactivate<C: Clock>(mut ctx: Context<C>, id: Uuid) -> Result<()> {
    let user = ctx.require_user()?;
    let now = ctx.clock.now();
    let medicine = actions::deactivate_medicine(&mut ctx.store, &user, id, &now)?;
    println!("✓ Deactivated {} from {}", medicine.name, now.date_naive());
    Ok(())
}

fn cmd_log<C: Clock>(ctx: Context<C>, medicine_id: Uuid, time: NaiveTime, taken: bool) -> Result<()> {
    let user = ctx.require_user()?;
    let now = ctx.clock.now();
    let coordinator = Coordinator::new(ctx.store, ctx.clock, Some(user.clone()));

    coordinator.with_store(|store| {
        actions::record_dose(store, &user, medicine_id, time, taken, &now)
    })?;
    println!(
        "✓ Dose at {} logged as {}",
        time.format("%H:%M"),
        if taken { "taken" } else { "missed" }
    );

    if let Some(value) = coordinator
        .fire(Trigger::EventsChanged)
        .and_then(|report| report.adherence)
    {
        println!("Today's adherence: {}%", value);
    }
    Ok(())
}

fn cmd_status<C: Clock>(ctx: Context<C>) -> Result<()> {
    let user = ctx.require_user()?;
    let coordinator = Coordinator::new(ctx.store, ctx.clock, Some(user.clone()));

    let report = coordinator
        .fire(Trigger::Appeared)
        .ok_or_else(|| Error::Other("no pass ran".into()))?;
    if report.reconcile_failed {
        eprintln!("Warning: missed doses could not be recorded, showing last saved state");
    }
    if report.missed_created > 0 {
        println!("Recorded {} missed dose(s)", report.missed_created);
    }

    let now = coordinator.clock().now();
    let daily = coordinator.with_store(|store| -> Result<AdherenceReport> {
        let medicines = active_medicines(&*store, &user, &now)?;
        let events = events_for_day(&*store, &user, &now)?;
        Ok(daily_report(&medicines, &events, &now))
    })?;

    println!("\n{} for {}", daily.date, user);
    if daily.medicines.is_empty() {
        println!("  No medicines scheduled today");
    }
    for medicine in &daily.medicines {
        println!(
            "  {:<20} taken {}/{}  pending {}  {}%",
            medicine.name, medicine.taken, medicine.due, medicine.pending, medicine.percentage
        );
    }

    let overall = report.adherence.unwrap_or(daily.overall);
    println!("\nToday's adherence: {}%", overall);
    Ok(())
}

fn cmd_watch<C: Clock + 'static>(ctx: Context<C>, ticks: Option<u32>, interval: Option<u64>) -> Result<()> {
    let user = ctx.require_user()?;
    let interval = match interval {
        Some(0) => return Err(Error::InvalidInput("interval must be at least 1 second".into())),
        Some(secs) => Duration::from_secs(secs),
        None => ctx.config.tick_interval(),
    };

    let coordinator = Arc::new(Coordinator::new(ctx.store, ctx.clock, Some(user)));
    let updates = coordinator.subscribe();
    coordinator.fire(Trigger::Appeared);

    let ticker = Ticker::spawn(&coordinator, interval)?;
    let deadline = ticks.map(|n| Instant::now() + interval * n + interval / 2);

    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => break,
            },
            None => interval,
        };
        match updates.recv_timeout(wait) {
            Ok(value) => println!("Today's adherence: {}%", value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ticker.stop();
    Ok(())
}

fn cmd_purge<C: Clock>(mut ctx: Context<C>) -> Result<()> {
    let now = ctx.clock.now();
    let (day_start, _) = schedule::day_bounds(&now)?;
    let cutoff = (day_start - ChronoDuration::days(ctx.config.schedule.retention_days)).with_timezone(&Utc);

    let purged = ctx.store.purge_events_before(cutoff)?;
    println!(
        "✓ Purged {} dose events older than {} days",
        purged, ctx.config.schedule.retention_days
    );
    Ok(())
}

fn cmd_export<C: Clock>(ctx: Context<C>, path: PathBuf) -> Result<()> {
    let user = ctx.require_user()?;
    let events = ctx
        .store
        .events_between(&user, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)?;
    let medicines = ctx.store.medicines_for_user(&user)?;

    let count = export::write_events_csv(&events, &medicines, &path)?;
    println!("✓ Exported {} dose events", count);
    println!("  CSV: {}", path.display());
    Ok(())
}

fn format_times(medicine: &Medicine) -> String {
    medicine
        .doses
        .iter()
        .map(|d| d.time_of_day.format("%H:%M").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
