use std::env;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use parley_storage::{
    ChannelId, ConversationId, MemberId, MessagePatch, MessageStore, NewMessage, ScopeKey,
    ScopeStore, SqliteStorage, StorageError,
};
use parley_sync::{
    ConnectionState, LiveChannel, LiveEvent, SessionContext, SettingsStore, StoragePageSource,
    SyncError, SyncSettings, TransportSignal, encode_event,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    Pagination,
    LiveDedupe,
    LiveUpdate,
    FallbackPoll,
    UnknownScope,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pagination" => Some(Self::Pagination),
            "live_dedupe" => Some(Self::LiveDedupe),
            "live_update" => Some(Self::LiveUpdate),
            "fallback_poll" => Some(Self::FallbackPoll),
            "unknown_scope" => Some(Self::UnknownScope),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Pagination => "pagination",
            Self::LiveDedupe => "live_dedupe",
            Self::LiveUpdate => "live_update",
            Self::FallbackPoll => "fallback_poll",
            Self::UnknownScope => "unknown_scope",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sync call failed on `{stage}`: {source}"))]
    SyncCall {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("live frame encoding failed on `{stage}`: {source}"))]
    Wire {
        stage: &'static str,
        source: parley_sync::WireError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

/// Short enough for the fallback scenario to observe a few ticks quickly.
const QA_FALLBACK_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings = SettingsStore::load().settings();
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| settings.database_path().display().to_string());
    println!("scenario={}", args.scenario.name());
    println!("db_path={db_path}");

    let storage = Arc::new(SqliteStorage::open(&db_path).await.context(StorageSnafu {
        stage: "runner-open-storage",
    })?);
    let settings = SyncSettings {
        fallback_interval_ms: QA_FALLBACK_INTERVAL.as_millis() as u64,
        ..(*settings).clone()
    }
    .normalized();

    match args.scenario {
        Scenario::Pagination => run_pagination(&storage, &settings).await,
        Scenario::LiveDedupe => run_live_dedupe(&storage, &settings).await,
        Scenario::LiveUpdate => run_live_update(&storage, &settings).await,
        Scenario::FallbackPoll => run_fallback_poll(&storage, &settings).await,
        Scenario::UnknownScope => run_unknown_scope(&storage, &settings).await,
        Scenario::All => run_all(&storage, &settings).await,
    }?;

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn run_all(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    run_pagination(storage, settings).await?;
    run_live_dedupe(storage, settings).await?;
    run_live_update(storage, settings).await?;
    run_fallback_poll(storage, settings).await?;
    run_unknown_scope(storage, settings).await?;
    println!("all_passed=true");
    Ok(())
}

fn session_for(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> SessionContext {
    SessionContext::new(
        LiveChannel::new(),
        Arc::new(StoragePageSource::new(Arc::clone(storage))),
        Arc::new(settings.clone()),
    )
}

fn seed_scope(storage: &SqliteStorage, scope: ScopeKey, count: usize) -> RunnerResult<()> {
    storage.register_scope(scope).context(StorageSnafu {
        stage: "seed-register-scope",
    })?;
    let author = MemberId::new_v7();
    for index in 0..count {
        let input = NewMessage::text(author, format!("seed-{index}")).context(StorageSnafu {
            stage: "seed-build-message",
        })?;
        storage.append_message(scope, input).context(StorageSnafu {
            stage: "seed-append-message",
        })?;
    }
    Ok(())
}

fn check(condition: bool, scenario: &'static str, reason: impl FnOnce() -> String) -> RunnerResult<()> {
    if condition {
        Ok(())
    } else {
        ScenarioFailedSnafu {
            stage: "scenario-check",
            scenario,
            reason: reason(),
        }
        .fail()
    }
}

async fn run_pagination(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    let scope = ScopeKey::Channel(ChannelId::new_v7());
    let total = settings.batch_size + 3;
    seed_scope(storage, scope, total)?;

    let session = session_for(storage, settings);
    let handle = session.open_scope(scope).await.context(SyncCallSnafu {
        stage: "scenario-pagination-open",
    })?;
    let first_len = handle.current_messages().len();
    println!("pagination_first_page={first_len}");

    let second = handle.load_next().await.context(SyncCallSnafu {
        stage: "scenario-pagination-load-next",
    })?;
    let second_len = second.map(|page| page.messages.len()).unwrap_or_default();
    println!("pagination_second_page={second_len}");
    println!("pagination_has_more={}", handle.has_more());

    let exhausted = handle
        .load_next()
        .await
        .context(SyncCallSnafu {
            stage: "scenario-pagination-exhausted",
        })?
        .is_none();
    println!("pagination_exhausted={exhausted}");

    check(
        first_len == settings.batch_size && second_len == 3 && !handle.has_more() && exhausted,
        "pagination",
        || format!("unexpected page shape {first_len}+{second_len}"),
    )?;
    handle.close().await;
    Ok(())
}

async fn run_live_dedupe(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    let scope = ScopeKey::Conversation(ConversationId::new_v7());
    seed_scope(storage, scope, 2)?;

    let session = session_for(storage, settings);
    let handle = session.open_scope(scope).await.context(SyncCallSnafu {
        stage: "scenario-live-dedupe-open",
    })?;

    let author = MemberId::new_v7();
    let input = NewMessage::text(author, "A").context(StorageSnafu {
        stage: "scenario-live-dedupe-build",
    })?;
    let created = storage.append_message(scope, input).context(StorageSnafu {
        stage: "scenario-live-dedupe-append",
    })?;
    let frame = encode_event(&LiveEvent::Created(created)).context(WireSnafu {
        stage: "scenario-live-dedupe-encode",
    })?;

    // A reconnect replay delivers the same frame twice.
    let signals = futures::stream::iter(vec![
        TransportSignal::Connected,
        TransportSignal::Frame(frame.clone()),
        TransportSignal::Frame(frame),
    ]);
    session.live().run_transport(signals).await;

    let messages = handle.current_messages();
    let copies = messages.iter().filter(|message| message.content == "A").count();
    println!("live_dedupe_total={}", messages.len());
    println!("live_dedupe_copies={copies}");
    check(
        copies == 1 && messages.len() == 3 && messages[0].content == "A",
        "live_dedupe",
        || format!("expected one copy of A at the head, saw {copies}"),
    )?;
    handle.close().await;
    Ok(())
}

async fn run_live_update(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    let scope = ScopeKey::Conversation(ConversationId::new_v7());
    seed_scope(storage, scope, 3)?;

    let session = session_for(storage, settings);
    let handle = session.open_scope(scope).await.context(SyncCallSnafu {
        stage: "scenario-live-update-open",
    })?;
    let before = handle.current_messages();
    let target = before[1].id;

    let edited = storage
        .update_message(
            scope,
            target,
            MessagePatch {
                content: Some("edited".to_string()),
            },
        )
        .context(StorageSnafu {
            stage: "scenario-live-update-edit",
        })?;
    session.live().dispatch(&LiveEvent::Updated(edited));
    let deleted = storage
        .soft_delete_message(scope, before[2].id)
        .context(StorageSnafu {
            stage: "scenario-live-update-delete",
        })?;
    session.live().dispatch(&LiveEvent::Updated(deleted));

    let after = handle.current_messages();
    let positions_kept = before
        .iter()
        .zip(after.iter())
        .all(|(old, new)| old.id == new.id);
    println!("live_update_positions_kept={positions_kept}");
    println!("live_update_content={}", after[1].content);
    println!("live_update_deleted={}", after[2].deleted);
    check(
        positions_kept && after[1].content == "edited" && after[2].deleted,
        "live_update",
        || "update was not applied in place".to_string(),
    )?;
    handle.close().await;
    Ok(())
}

async fn run_fallback_poll(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    let scope = ScopeKey::Channel(ChannelId::new_v7());
    seed_scope(storage, scope, 1)?;

    let session = session_for(storage, settings);
    let handle = session.open_scope(scope).await.context(SyncCallSnafu {
        stage: "scenario-fallback-open",
    })?;
    println!(
        "fallback_initial_state={:?}",
        session.live().connection_state()
    );

    seed_more(storage, scope, "polled")?;
    tokio::time::sleep(settings.fallback_interval() * 3).await;
    let polled = contains_content(&handle.current_messages(), "polled");
    println!("fallback_polled_while_disconnected={polled}");

    session.live().set_connection_state(ConnectionState::Connected);
    tokio::time::sleep(settings.fallback_interval()).await;
    seed_more(storage, scope, "silent")?;
    tokio::time::sleep(settings.fallback_interval() * 3).await;
    let silent = contains_content(&handle.current_messages(), "silent");
    println!("fallback_polled_while_connected={silent}");

    check(polled && !silent, "fallback_poll", || {
        format!("polled={polled} silent={silent}")
    })?;
    handle.close().await;
    Ok(())
}

async fn run_unknown_scope(storage: &Arc<SqliteStorage>, settings: &SyncSettings) -> RunnerResult<()> {
    let session = session_for(storage, settings);
    let scope = ScopeKey::Conversation(ConversationId::new_v7());
    let outcome = session.open_scope(scope).await;
    let scope_error = matches!(outcome, Err(SyncError::Scope { .. }));
    println!("unknown_scope_error={scope_error}");
    println!("unknown_scope_registered={}", session.scope(scope).is_some());
    check(
        scope_error && session.open_scopes().is_empty(),
        "unknown_scope",
        || "unregistered scope opened or stayed registered".to_string(),
    )
}

fn seed_more(storage: &SqliteStorage, scope: ScopeKey, content: &str) -> RunnerResult<()> {
    let input = NewMessage::text(MemberId::new_v7(), content).context(StorageSnafu {
        stage: "seed-more-build",
    })?;
    storage.append_message(scope, input).context(StorageSnafu {
        stage: "seed-more-append",
    })?;
    Ok(())
}

fn contains_content(messages: &[parley_sync::Message], content: &str) -> bool {
    messages.iter().any(|message| message.content == content)
}
