//! kdbsafe - KeePass 1.x password database tool
//!
//! Usage:
//!   kdbsafe create <db>                 - Create a new empty database
//!   kdbsafe tree <db>                   - Show groups and entries
//!   kdbsafe add-entry <db> --group <id> - Add an entry
//!   kdbsafe search <db> <query>         - Search entries
//!   kdbsafe generate                    - Generate a random password

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use kdbsafe::{
    config::Config,
    crypto::{Algorithm, Credentials},
    generator::{generate_password, PasswordPolicy},
    session::{Session, SessionSettings},
    tree::{Database, EntryFields, EntryId, GroupId, ItemId, SearchScope, SortOrder},
    Error,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "kdbsafe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "KeePass 1.x compatible password database tool")]
struct Cli {
    /// Configuration file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Key file used together with (or instead of) the master password
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Read the master password from a file instead of prompting
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CipherArg {
    Aes,
    Twofish,
}

impl From<CipherArg> for Algorithm {
    fn from(arg: CipherArg) -> Self {
        match arg {
            CipherArg::Aes => Algorithm::Aes256,
            CipherArg::Twofish => Algorithm::Twofish,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new empty database
    Create {
        /// Database file
        database: PathBuf,

        /// Payload cipher (defaults to the configured one)
        #[arg(long, value_enum)]
        cipher: Option<CipherArg>,

        /// Key transformation rounds (defaults to the configured value)
        #[arg(long)]
        rounds: Option<u32>,
    },

    /// Show database settings and counts
    Info {
        database: PathBuf,
    },

    /// Show the group tree with entries
    Tree {
        database: PathBuf,

        /// Sort groups and entries alphabetically
        #[arg(long)]
        sort: bool,
    },

    /// Add a group
    AddGroup {
        database: PathBuf,

        /// Group name
        name: String,

        /// Parent group id (top level when omitted)
        #[arg(long)]
        parent: Option<u32>,
    },

    /// Add an entry
    AddEntry {
        database: PathBuf,

        /// Group id
        #[arg(long)]
        group: u32,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        username: String,

        #[arg(long, default_value = "")]
        url: String,

        #[arg(long, default_value = "")]
        comment: String,

        /// Generate the entry password instead of prompting for it
        #[arg(long)]
        generate: bool,
    },

    /// Search entries by title, username, URL and comment
    Search {
        database: PathBuf,

        query: String,

        /// Restrict the search to a group and its subgroups
        #[arg(long)]
        group: Option<u32>,
    },

    /// Show an entry
    Show {
        database: PathBuf,

        /// Entry id
        entry: Uuid,

        /// Print the password
        #[arg(long)]
        reveal: bool,
    },

    /// Move an entry to another group
    Move {
        database: PathBuf,

        /// Entry id
        entry: Uuid,

        /// Target group id
        group: u32,
    },

    /// Delete a group with everything in it, or a single entry
    Delete {
        database: PathBuf,

        /// Group id
        #[arg(long, conflicts_with = "entry", required_unless_present = "entry")]
        group: Option<u32>,

        /// Entry id
        #[arg(long)]
        entry: Option<Uuid>,

        /// Do not copy deleted entries into the Backup group
        #[arg(long)]
        no_backup: bool,
    },

    /// Change the master password
    Passwd {
        database: PathBuf,

        /// Also change the key transformation rounds
        #[arg(long)]
        rounds: Option<u32>,
    },

    /// Generate a random password
    Generate {
        #[arg(short, long, default_value_t = 16)]
        length: usize,

        #[arg(long)]
        no_lowercase: bool,

        #[arg(long)]
        no_uppercase: bool,

        #[arg(long)]
        no_digits: bool,

        #[arg(long)]
        specials: bool,

        /// Leave out characters that look alike
        #[arg(long)]
        exclude_lookalike: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let writer = match &config.logging.file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(expand_tilde(path)) {
            Ok(file) => BoxMakeWriter::new(Arc::new(file)),
            Err(e) => {
                eprintln!("Cannot open log file {:?}: {}", path, e);
                BoxMakeWriter::new(std::io::stderr)
            }
        },
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set up logging");
    }

    if let Err(e) = run_command(&cli, config, &config_path) {
        match e.downcast_ref::<Error>() {
            Some(inner) => error!("{:?} error: {:#}", inner.category(), e),
            None => error!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run_command(cli: &Cli, config: Config, config_path: &Path) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Create {
            database,
            cipher,
            rounds,
        } => cmd_create(cli, config, config_path, database, *cipher, *rounds),
        Commands::Info { database } => cmd_info(cli, &config, database),
        Commands::Tree { database, sort } => cmd_tree(cli, &config, database, *sort),
        Commands::AddGroup {
            database,
            name,
            parent,
        } => cmd_add_group(cli, &config, database, name, *parent),
        Commands::AddEntry {
            database,
            group,
            title,
            username,
            url,
            comment,
            generate,
        } => {
            let fields = EntryFields::new(title.as_str())
                .username(username.as_str())
                .url(url.as_str())
                .comment(comment.as_str());
            cmd_add_entry(cli, &config, database, *group, fields, *generate)
        }
        Commands::Search {
            database,
            query,
            group,
        } => cmd_search(cli, &config, database, query, *group),
        Commands::Show {
            database,
            entry,
            reveal,
        } => cmd_show(cli, &config, database, *entry, *reveal),
        Commands::Move {
            database,
            entry,
            group,
        } => cmd_move(cli, &config, database, *entry, *group),
        Commands::Delete {
            database,
            group,
            entry,
            no_backup,
        } => {
            let item = match (group, entry) {
                (Some(group), _) => ItemId::Group(GroupId(*group)),
                (None, Some(entry)) => ItemId::Entry(EntryId(*entry)),
                (None, None) => bail!("Either --group or --entry is required"),
            };
            cmd_delete(cli, &config, database, item, !*no_backup)
        }
        Commands::Passwd { database, rounds } => cmd_passwd(cli, &config, database, *rounds),
        Commands::Generate {
            length,
            no_lowercase,
            no_uppercase,
            no_digits,
            specials,
            exclude_lookalike,
        } => cmd_generate(PasswordPolicy {
            length: *length,
            lowercase: !*no_lowercase,
            uppercase: !*no_uppercase,
            digits: !*no_digits,
            specials: *specials,
            exclude_lookalike: *exclude_lookalike,
            every_group: true,
        }),
    }
}

/// Master password from `--password-file` or an interactive prompt
fn read_password(cli: &Cli, prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    let password = match &cli.password_file {
        Some(path) => {
            let content = Zeroizing::new(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read password file {:?}", path))?,
            );
            Zeroizing::new(content.trim_end_matches(['\r', '\n']).to_string())
        }
        None => Zeroizing::new(rpassword::prompt_password(prompt).context("Failed to read password")?),
    };
    Ok(password)
}

fn credentials(cli: &Cli, prompt: &str) -> anyhow::Result<Credentials> {
    let password = read_password(cli, prompt)?;
    let mut credentials = Credentials::new(password.as_str());
    if let Some(key_file) = &cli.key_file {
        credentials = credentials.with_key_file(expand_tilde(key_file));
    }
    Ok(credentials)
}

/// Open a database; the key derivation can be aborted with Ctrl-C
fn open_session(
    cli: &Cli,
    config: &Config,
    path: &Path,
    read_only: bool,
) -> anyhow::Result<Session> {
    let credentials = credentials(cli, "Master password: ")?;
    let mut session = Session::new(SessionSettings::from_config(config));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let cancelled = runtime.block_on(async {
        session.begin_open(path, &credentials, read_only)?;
        let cancelled = tokio::select! {
            result = session.complete_open() => {
                result?;
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        };
        Ok::<bool, Error>(cancelled)
    });

    if cancelled.with_context(|| format!("Failed to open {:?}", path))? {
        session.cancel_open();
        bail!("Opening {:?} was cancelled", path);
    }
    Ok(session)
}

fn save(session: &mut Session) -> anyhow::Result<()> {
    session.save().context("Failed to save database")?;
    Ok(())
}

fn cmd_create(
    cli: &Cli,
    mut config: Config,
    config_path: &Path,
    database: &Path,
    cipher: Option<CipherArg>,
    rounds: Option<u32>,
) -> anyhow::Result<()> {
    let algorithm = cipher.map(Algorithm::from).unwrap_or(config.database.algorithm);
    let rounds = rounds.unwrap_or(config.database.rounds);

    let credentials = credentials(cli, "New master password: ")?;
    if cli.password_file.is_none() {
        let repeat = read_password(cli, "Repeat master password: ")?;
        if repeat.as_str() != credentials.password() {
            bail!("Passwords do not match");
        }
    }

    let mut session = Session::new(SessionSettings::from_config(&config));
    session
        .create(database, &credentials, algorithm, rounds)
        .with_context(|| format!("Failed to create {:?}", database))?;
    println!("Created {:?} ({}, {} rounds)", database, algorithm, rounds);

    config.set_recent_database(database, cli.key_file.as_deref());
    if let Err(e) = config.save(config_path) {
        warn!("Could not update config: {}", e);
    }
    Ok(())
}

fn cmd_info(cli: &Cli, config: &Config, database: &Path) -> anyhow::Result<()> {
    let session = open_session(cli, config, database, true)?;
    session.read(|db| {
        println!("File:        {:?}", database);
        println!("Cipher:      {}", db.algorithm());
        println!("Rounds:      {}", db.rounds());
        println!("Groups:      {}", db.group_count());
        println!("Entries:     {}", db.entry_count());
        println!("Meta data:   {} streams", db.meta_streams().len());
    })?;
    Ok(())
}

fn print_group(db: &Database, id: GroupId, depth: usize, order: SortOrder) -> kdbsafe::Result<()> {
    let indent = "  ".repeat(depth);
    let group = db.group_required(id)?;
    println!("{}[{}] {}", indent, group.id, group.name);
    for entry in db.entries_in(id, order)? {
        println!("{}  - {} ({})", indent, entry.title, entry.id);
    }
    for child in db.child_groups(Some(id), order)? {
        print_group(db, child.id, depth + 1, order)?;
    }
    Ok(())
}

fn cmd_tree(cli: &Cli, config: &Config, database: &Path, sort: bool) -> anyhow::Result<()> {
    let order = if sort {
        SortOrder::Alphabetical
    } else {
        SortOrder::Database
    };
    let session = open_session(cli, config, database, true)?;
    session.read(|db| -> kdbsafe::Result<()> {
        for group in db.child_groups(None, order)? {
            print_group(db, group.id, 0, order)?;
        }
        Ok(())
    })??;
    Ok(())
}

fn cmd_add_group(
    cli: &Cli,
    config: &Config,
    database: &Path,
    name: &str,
    parent: Option<u32>,
) -> anyhow::Result<()> {
    let mut session = open_session(cli, config, database, false)?;
    let id = session.modify(|db| db.add_group(parent.map(GroupId), name))?;
    save(&mut session)?;
    println!("Added group {} ({})", name, id);
    Ok(())
}

fn cmd_add_entry(
    cli: &Cli,
    config: &Config,
    database: &Path,
    group: u32,
    fields: EntryFields,
    generate: bool,
) -> anyhow::Result<()> {
    let mut session = open_session(cli, config, database, false)?;

    let password = if generate {
        generate_password(&PasswordPolicy::default())?
    } else {
        Zeroizing::new(rpassword::prompt_password("Entry password: ").context("Failed to read password")?)
    };
    let fields = fields.password(password.as_str());

    let id = session.modify(|db| db.add_entry(GroupId(group), &fields))?;
    save(&mut session)?;
    println!("Added entry {} ({})", fields.title, id);
    if generate {
        println!("Generated password: {}", password.as_str());
    }
    Ok(())
}

fn cmd_search(
    cli: &Cli,
    config: &Config,
    database: &Path,
    query: &str,
    group: Option<u32>,
) -> anyhow::Result<()> {
    let scope = match group {
        Some(id) => SearchScope::Group(GroupId(id)),
        None => SearchScope::Database,
    };
    let session = open_session(cli, config, database, true)?;
    let count = session.read(|db| -> kdbsafe::Result<usize> {
        let mut count = 0;
        for entry in db.search(query, scope)? {
            let group = db.group(entry.group).map(|g| g.name.as_str()).unwrap_or("?");
            println!("{}  {} / {}  {}", entry.id, group, entry.title, entry.username);
            count += 1;
        }
        Ok(count)
    })??;
    info!("{} matching entries", count);
    Ok(())
}

fn cmd_show(
    cli: &Cli,
    config: &Config,
    database: &Path,
    entry: Uuid,
    reveal: bool,
) -> anyhow::Result<()> {
    let session = open_session(cli, config, database, true)?;
    session.read(|db| -> kdbsafe::Result<()> {
        let entry = db.entry_required(EntryId(entry))?;
        println!("Title:     {}", entry.title);
        println!("Username:  {}", entry.username);
        println!("URL:       {}", entry.url);
        if reveal {
            println!("Password:  {}", entry.password.reveal()?.as_str());
        } else if !entry.password.is_empty() {
            println!("Password:  ********");
        }
        println!("Comment:   {}", entry.comment);
        println!("Created:   {}", entry.times.created);
        println!("Modified:  {}", entry.times.modified);
        if !entry.times.never_expires() {
            println!("Expires:   {}", entry.times.expires);
        }
        if !entry.binary.is_empty() {
            println!("Attachment: {} ({} bytes)", entry.binary_desc, entry.binary.len());
        }
        Ok(())
    })??;
    Ok(())
}

fn cmd_move(
    cli: &Cli,
    config: &Config,
    database: &Path,
    entry: Uuid,
    group: u32,
) -> anyhow::Result<()> {
    let mut session = open_session(cli, config, database, false)?;
    if session.modify(|db| db.move_entry(EntryId(entry), GroupId(group)))? {
        save(&mut session)?;
        println!("Moved {} to group {}", entry, group);
    } else {
        println!("Entry {} is already in group {}", entry, group);
    }
    Ok(())
}

fn cmd_delete(
    cli: &Cli,
    config: &Config,
    database: &Path,
    item: ItemId,
    backup: bool,
) -> anyhow::Result<()> {
    let mut session = open_session(cli, config, database, false)?;
    let deleted = session.delete(item, backup)?;
    save(&mut session)?;
    println!(
        "Deleted {} groups and {} entries",
        deleted.removed.groups, deleted.removed.entries
    );
    if deleted.backed_up > 0 {
        println!("Kept {} copies in the Backup group", deleted.backed_up);
    } else if backup && deleted.removed.entries > 0 {
        println!("No backup copies were made");
    }
    Ok(())
}

fn cmd_passwd(
    cli: &Cli,
    config: &Config,
    database: &Path,
    rounds: Option<u32>,
) -> anyhow::Result<()> {
    let mut session = open_session(cli, config, database, false)?;

    let password = Zeroizing::new(
        rpassword::prompt_password("New master password: ").context("Failed to read password")?,
    );
    let repeat = Zeroizing::new(
        rpassword::prompt_password("Repeat new master password: ")
            .context("Failed to read password")?,
    );
    if password.as_str() != repeat.as_str() {
        bail!("Passwords do not match");
    }
    let mut credentials = Credentials::new(password.as_str());
    if let Some(key_file) = &cli.key_file {
        credentials = credentials.with_key_file(expand_tilde(key_file));
    }

    session.change_password(&credentials)?;
    if let Some(rounds) = rounds {
        session.set_rounds(rounds)?;
    }
    save(&mut session)?;
    println!("Master password changed");
    Ok(())
}

fn cmd_generate(policy: PasswordPolicy) -> anyhow::Result<()> {
    let password = generate_password(&policy)?;
    println!("{}", password.as_str());
    info!("Estimated strength: {:.0} bits", policy.entropy_bits());
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
