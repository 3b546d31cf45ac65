use std::process;

use anyhow::Context;
use clap::Parser;

use wptsync::bugzilla::BugzillaClient;
use wptsync::config::Config;
use wptsync::env::Environment;
use wptsync::gh::GhCli;
use wptsync::lock::ProcessLock;
use wptsync::shell_exec::Cmd;
use wptsync::store::{PrStatus, Status, SyncStore};
use wptsync::upstream::push::{self, PrEvent, PushOutcome};
use wptsync::upstream::UpstreamSync;

mod cli;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .format_timestamp_secs()
    .init();

    if let Err(e) = run(cli) {
        if verbose {
            // Debug formatting includes the backtrace when RUST_BACKTRACE is set
            log::error!("{:?}", e);
        } else {
            log::error!("{:#}", e);
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let bz = BugzillaClient::new(&config.bugzilla.url, config.bugzilla.api_key.clone())?;
    let gh = GhCli::new(&config.github.repo);
    let env = Environment::new(config, Box::new(bz), Box::new(gh))?;
    let store = SyncStore::new(&env.gecko);

    // Every command may mutate syncs; all of them run inside the lock
    let lock = ProcessLock::acquire(&env.config.root, "upstream")?;

    match cli.command {
        Commands::Update => do_update(&lock, &env, &store),
        Commands::Upstream { rev, base_rev } => {
            do_upstream(&lock, &env, &store, rev.as_deref(), base_rev.as_deref())
        }
        Commands::Pr { pr_id } => do_pr(&lock, &env, &store, pr_id),
        Commands::Bug { bug } => do_bug(&lock, &env, &store, bug),
        Commands::List { sync_type, error } => do_list(&store, &sync_type, error),
        Commands::Detail { sync_type, obj_id } => do_detail(&env, &store, &sync_type, obj_id),
        Commands::Status {
            obj_type,
            sync_type,
            obj_id,
            new_status,
            old_status,
            seq_id,
        } => do_status(
            &store, &obj_type, &sync_type, obj_id, &new_status, &old_status, seq_id,
        ),
        Commands::Delete {
            sync_type,
            obj_id,
            try_pushes,
        } => do_delete(&env, &store, &sync_type, obj_id, try_pushes),
        Commands::Fetch { repo } => do_fetch(&env, &repo),
    }
}

fn report_outcome(outcome: &PushOutcome) {
    for sync in &outcome.pushed {
        println!("updated {}", sync.id());
    }
    for sync in &outcome.landed {
        println!("landed {}", sync.id());
    }
    for (sync, error) in &outcome.failed {
        println!("failed {}: {}", sync.id(), error);
    }
}

fn do_update(lock: &ProcessLock, env: &Environment, store: &SyncStore) -> anyhow::Result<()> {
    env.gecko.fetch(&env.config.gecko.remote)?;
    env.wpt.fetch(&env.config.wpt.remote)?;
    let outcome = push::gecko_push(
        lock,
        env,
        store,
        &env.config.gecko.refs.integration,
        None,
        false,
    )?;
    report_outcome(&outcome);
    Ok(())
}

fn do_upstream(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    rev: Option<&str>,
    base_rev: Option<&str>,
) -> anyhow::Result<()> {
    let rev = match rev {
        Some(rev) => rev.to_string(),
        None => env.config.gecko.refs.integration.clone(),
    };
    let outcome = push::gecko_push(lock, env, store, &rev, base_rev, false)?;
    report_outcome(&outcome);
    Ok(())
}

fn do_pr(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    pr_id: Option<u64>,
) -> anyhow::Result<()> {
    let pr_id = match pr_id {
        Some(id) => id,
        None => sync_from_path(store)?
            .pr()
            .context("Sync for the current branch has no PR")?,
    };
    let pull = env.gh.get_pull(pr_id)?;
    let mut sync = match UpstreamSync::for_pr(store, pr_id)? {
        Some(sync) => sync,
        None => push::sync_from_pr(lock, env, store, pr_id, pull.body.as_deref().unwrap_or(""))?
            .with_context(|| format!("PR {} carries no sync metadata", pr_id))?,
    };

    if pull.state == wptsync::gh::PullState::Closed {
        let merge_sha = if pull.merged {
            pull.merge_commit_sha.clone()
        } else {
            None
        };
        push::update_pr(
            lock,
            env,
            &mut sync,
            PrEvent::Closed {
                merge_sha,
                base_sha: None,
                merged_by: None,
            },
        )?;
        return Ok(());
    }

    if sync.pr_status() == PrStatus::Closed {
        push::update_pr(lock, env, &mut sync, PrEvent::Reopened)?;
    }
    let outcome = push::update_sync(lock, env, store, sync)?;
    report_outcome(&outcome);
    Ok(())
}

fn do_bug(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    bug: Option<u64>,
) -> anyhow::Result<()> {
    let bug = match bug {
        Some(bug) => bug,
        None => sync_from_path(store)?.bug(),
    };
    let syncs = UpstreamSync::for_bug(store, bug, &[Status::Open, Status::Incomplete])?;
    if syncs.is_empty() {
        println!("no open syncs for bug {}", bug);
        return Ok(());
    }
    for sync in syncs {
        let outcome = push::update_sync(lock, env, store, sync)?;
        report_outcome(&outcome);
    }
    Ok(())
}

fn do_list(store: &SyncStore, sync_types: &[String], error_only: bool) -> anyhow::Result<()> {
    if !sync_types.is_empty() && !sync_types.iter().any(|t| t == "upstream") {
        // Peer sync types live in other processes
        return Ok(());
    }
    for sync in UpstreamSync::load_by_status(store, Status::Open)? {
        if error_only && sync.error().is_none() {
            continue;
        }
        let flag = if sync.error().is_some() { "*" } else { " " };
        let pr = sync
            .pr()
            .map(|pr| pr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = sync
            .error()
            .map(|e| format!(" ERROR: {}", e.lines().next().unwrap_or_default()))
            .unwrap_or_default();
        println!(
            "{} upstream {} bug:{} PR:{}{}",
            flag,
            sync.status(),
            sync.bug(),
            pr,
            error
        );
    }
    Ok(())
}

fn do_detail(
    env: &Environment,
    store: &SyncStore,
    sync_type: &str,
    bug: u64,
) -> anyhow::Result<()> {
    if sync_type != "upstream" {
        anyhow::bail!("Only upstream syncs are handled here");
    }
    for id in store.list(None, Some(bug))? {
        let sync = UpstreamSync::load(store, id)?;
        println!("{}", sync.output(env)?);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn do_status(
    store: &SyncStore,
    obj_type: &str,
    sync_type: &str,
    bug: u64,
    new_status: &str,
    old_status: &str,
    seq_id: Option<u32>,
) -> anyhow::Result<()> {
    if obj_type != "sync" || sync_type != "upstream" {
        anyhow::bail!("Only upstream syncs are handled here");
    }
    let new_status: Status = new_status
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown status {:?}", new_status))?;
    let old_status: Option<Status> = if old_status == "*" {
        None
    } else {
        Some(
            old_status
                .parse()
                .map_err(|_| anyhow::anyhow!("Unknown status {:?}", old_status))?,
        )
    };
    for id in store.list(old_status, Some(bug))? {
        if seq_id.is_some_and(|seq| seq != id.seq) {
            continue;
        }
        // Operator escape hatch: moves the refs without transition validation
        let new_id = store.transition(id, new_status)?;
        println!("{} -> {}", id, new_id);
    }
    Ok(())
}

fn do_delete(
    env: &Environment,
    store: &SyncStore,
    sync_type: &str,
    bug: u64,
    try_pushes: bool,
) -> anyhow::Result<()> {
    if sync_type != "upstream" {
        anyhow::bail!("Only upstream syncs are handled here");
    }
    if try_pushes {
        // Upstream syncs never create try pushes; those belong to the
        // downstream sync
        log::info!("No try pushes for upstream syncs");
        return Ok(());
    }
    for id in store.list(None, Some(bug))? {
        let branch = id.branch_name();
        env.wpt.remove_worktree(&env.config.work_dir(&branch))?;
        if env.wpt.branch_exists(&branch)? {
            env.wpt.delete_branch(&branch)?;
        }
        store.delete(id)?;
        println!("deleted {}", id);
    }
    Ok(())
}

fn do_fetch(env: &Environment, repo: &str) -> anyhow::Result<()> {
    match repo {
        "gecko" => {
            log::info!("Fetching gecko...");
            env.gecko.fetch(&env.config.gecko.remote)
        }
        "web-platform-tests" => {
            log::info!("Fetching web-platform-tests...");
            env.wpt.fetch(&env.config.wpt.remote)
        }
        other => anyhow::bail!("Unknown repository {:?}", other),
    }
}

/// Resolve the sync owning the current directory's checked-out branch
/// (`sync/upstream/<seq>/<bug>`).
fn sync_from_path(store: &SyncStore) -> anyhow::Result<UpstreamSync> {
    let output = Cmd::new("git")
        .args(["symbolic-ref", "--short", "HEAD"])
        .run()
        .context("Failed to read current branch")?;
    if !output.status.success() {
        anyhow::bail!("Not on a branch");
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let mut parts = branch.split('/');
    let (Some("sync"), Some("upstream"), Some(seq), Some(bug)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("Branch {} is not a sync branch", branch);
    };
    let seq: u32 = seq.parse().context("Bad sequence id in branch name")?;
    let bug: u64 = bug.parse().context("Bad bug id in branch name")?;
    let id = store
        .list(None, Some(bug))?
        .into_iter()
        .find(|id| id.seq == seq)
        .with_context(|| format!("No sync found for branch {}", branch))?;
    UpstreamSync::load(store, id)
}
