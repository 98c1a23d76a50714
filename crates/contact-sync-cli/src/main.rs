use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use contact_sync_api::table::{render_buckets, render_contacts};
use contact_sync_api::{
    clean_buckets, list_buckets, split_list, AddRequest, ContactSyncApi, ContactSyncConfig,
    DeleteRequest, MoveRequest, PhotosRequest, UpdateRequest,
};
use contact_sync_core::{ActionKind, ContactStore, ExecutionMode};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dav")]
#[command(about = "Reconcile a CardDAV address book with a desired contact table")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Contacts {
        #[command(subcommand)]
        command: Box<ContactsCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum ContactsCommand {
    /// Print every remote contact.
    Fetch(FetchArgs),
    Add(AddArgs),
    Update(UpdateArgs),
    #[command(visible_aliases = ["remove", "rm"])]
    Delete(DeleteArgs),
    /// Archive a contact into a bucket and remove it remotely.
    Move(MoveArgs),
    /// Reconcile the remote collection against a desired table.
    Sync(SyncArgs),
    Photos(PhotosArgs),
    CleanBuckets(ApplyArgs),
    /// Recreate every contact under a new uid and href.
    RefreshUids(ApplyArgs),
    FixNames(ApplyArgs),
    TouchAll,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Also write the markdown table to this path.
    #[arg(long)]
    source: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    touch_all: bool,
    /// List archived bucket contacts instead of remote ones.
    #[arg(long, default_value_t = false)]
    un_contacts: bool,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    /// Comma separated.
    #[arg(long)]
    emails: Option<String>,
    /// Comma separated.
    #[arg(long)]
    phones: Option<String>,
    #[arg(long)]
    note: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    new_name: Option<String>,
    #[arg(long)]
    emails: Option<String>,
    #[arg(long)]
    phones: Option<String>,
    /// An empty value clears the note.
    #[arg(long)]
    note: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    name: String,
    /// Backup card path.
    #[arg(long)]
    vcf: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct MoveArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    bucket: String,
    #[arg(long)]
    new_name: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long, default_value_t = false)]
    apply: bool,
    /// Bump the revision of every surviving contact.
    #[arg(long, default_value_t = false)]
    touch: bool,
}

#[derive(Debug, Args)]
struct PhotosArgs {
    #[arg(long, default_value_t = false)]
    apply: bool,
    /// Replace photos that are already present.
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long)]
    map: Option<PathBuf>,
    /// `--gravatar` enables avatar lookups, `--gravatar=false` disables them;
    /// omitted, `ENABLE_GRAVATAR` decides.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    gravatar: Option<bool>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[arg(long, default_value_t = false)]
    apply: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_report<T: Serialize>(report: &T) -> Result<()> {
    emit_json(serde_json::to_value(report)?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn dry_run_mode(dry_run: bool) -> ExecutionMode {
    ExecutionMode::from_apply_flag(!dry_run)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ContactSyncConfig::from_env();
    match cli.command {
        Command::Contacts { command } => run_contacts(*command, config),
    }
}

fn run_contacts(command: ContactsCommand, config: ContactSyncConfig) -> Result<()> {
    match command {
        ContactsCommand::Fetch(args) if args.un_contacts => run_list_buckets(&config),
        ContactsCommand::CleanBuckets(args) => {
            emit_report(&clean_buckets(&config, ExecutionMode::from_apply_flag(args.apply))?)
        }
        ContactsCommand::Fetch(args) => run_fetch(&args, &mut ContactSyncApi::connect(config)?),
        ContactsCommand::Add(args) => {
            let request = AddRequest {
                name: args.name,
                emails: args.emails.as_deref().map(split_list).unwrap_or_default(),
                phones: args.phones.as_deref().map(split_list).unwrap_or_default(),
                note: args.note,
            };
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.add(request, dry_run_mode(args.dry_run))?)
        }
        ContactsCommand::Update(args) => {
            let request = UpdateRequest {
                name: args.name,
                new_name: args.new_name,
                emails: args.emails.as_deref().map(split_list),
                phones: args.phones.as_deref().map(split_list),
                note: args.note,
            };
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.update(request, dry_run_mode(args.dry_run))?)
        }
        ContactsCommand::Delete(args) => {
            let request = DeleteRequest { name: args.name, backup: args.vcf };
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.delete(request, dry_run_mode(args.dry_run))?)
        }
        ContactsCommand::Move(args) => {
            let request =
                MoveRequest { name: args.name, bucket: args.bucket, new_name: args.new_name };
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.move_to_bucket(request, dry_run_mode(args.dry_run))?)
        }
        ContactsCommand::Sync(args) => run_sync(&args, &mut ContactSyncApi::connect(config)?),
        ContactsCommand::Photos(args) => {
            let request =
                PhotosRequest { force: args.force, map: args.map, gravatar: args.gravatar };
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.photos(request, ExecutionMode::from_apply_flag(args.apply))?)
        }
        ContactsCommand::RefreshUids(args) => {
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.refresh_uids(ExecutionMode::from_apply_flag(args.apply))?)
        }
        ContactsCommand::FixNames(args) => {
            let mut api = ContactSyncApi::connect(config)?;
            emit_report(&api.fix_names(ExecutionMode::from_apply_flag(args.apply))?)
        }
        ContactsCommand::TouchAll => emit_report(&ContactSyncApi::connect(config)?.touch_all()?),
    }
}

fn run_list_buckets(config: &ContactSyncConfig) -> Result<()> {
    let listing = list_buckets(config, ExecutionMode::Apply)?;
    print!("{}", render_buckets(&listing.entries));
    for path in &listing.unreadable {
        tracing::warn!("unreadable card file {}", path.display());
    }
    Ok(())
}

fn run_fetch<S: ContactStore>(args: &FetchArgs, api: &mut ContactSyncApi<S>) -> Result<()> {
    let result = api.fetch(args.touch_all, args.source.as_deref())?;
    print!("{}", render_contacts(&result.contacts));
    if let Some(touched) = &result.touched {
        tracing::info!("touched {} contact(s)", touched.committed());
    }
    for failure in &result.failures {
        tracing::warn!("could not fetch {:?}: {}", failure.reference, failure.error);
    }
    Ok(())
}

fn run_sync<S: ContactStore>(args: &SyncArgs, api: &mut ContactSyncApi<S>) -> Result<()> {
    let outcome = api.sync(&args.source, ExecutionMode::from_apply_flag(args.apply), args.touch)?;
    let report = &outcome.report;
    emit_json(serde_json::json!({
        "mode": report.mode,
        "fetched": report.fetched,
        "survivors": report.survivors,
        "created": report.count(ActionKind::Create),
        "updated": report.count(ActionKind::Update),
        "removed_duplicates": report.count(ActionKind::RemoveDuplicate),
        "removed_extras": report.count(ActionKind::RemoveExtra),
        "skipped": report.count(ActionKind::SkipDesired),
        "failures": report.failures,
        "actions": report.actions,
        "verified": report.verified.len(),
        "table": outcome.table,
    }))
}
