//! CLI entry point for creeds.

mod cli;

use clap::Parser;
use cli::{Command, ConstitutionsAction, Decision, ReviewsAction, SessionsAction};
use creeds::api::rest::{
    ConstitutionSubmission, ReviewStatus, ReviewSubmission, SubmissionResponse, SuperegoCheck,
    TrendingConstitution,
};
use creeds::api::{ApiClient, RestClient};
use creeds::config::{load_config, write_default_config, Config};
use creeds::render::{Renderer, StreamPrinter};
use creeds::runtime::{FinalizePolicy, StreamRunEngine};
use creeds::session::SessionStore;
use creeds::store::{SessionRegistry, Stores};
use creeds::types::RunConfig;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    if let Command::Init { path } = &args.command {
        let renderer = Renderer::startup(args.no_color);
        match write_default_config(Path::new(path)) {
            Ok(true) => println!("wrote {path}"),
            Ok(false) => {
                let _ = renderer.warn(&mut io::stderr(), &format!("{path} already exists; left unchanged"));
            }
            Err(e) => {
                let _ = renderer.error(&mut io::stderr(), &e.to_string());
                std::process::exit(1);
            }
        }
        return;
    }

    let mut config = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            let _ = Renderer::startup(args.no_color).error(&mut io::stderr(), &e.to_string());
            std::process::exit(1);
        }
    };
    if let Some(url) = &args.base_url {
        config.server.base_url = url.trim().trim_end_matches('/').to_string();
    }
    let renderer = Renderer::from_config(&config.display, args.no_color);

    let session_store = match SessionStore::open(&config.sessions.dir) {
        Ok(store) => store,
        Err(msg) => {
            let _ = renderer.error(&mut io::stderr(), &msg);
            std::process::exit(1);
        }
    };
    let registry = match session_store.load() {
        Ok(Some(state)) => SessionRegistry::from_state(state),
        Ok(None) => SessionRegistry::new(),
        Err(msg) => {
            let _ = renderer.warn(&mut io::stderr(), &format!("{msg}; starting with no sessions"));
            SessionRegistry::new()
        }
    };

    let app = App::new(&config, Stores::with_sessions(registry), renderer);
    let result = app.run(args.command).await;

    if let Err(msg) = session_store.save(&app.stores.sessions.snapshot()) {
        let _ = renderer.warn(&mut io::stderr(), &msg);
    }
    if let Err(msg) = result {
        let _ = renderer.error(&mut io::stderr(), &msg);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "creeds=debug,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Everything one CLI invocation works against.
struct App {
    stores: Stores,
    engine: StreamRunEngine,
    rest: RestClient,
    renderer: Renderer,
}

impl App {
    fn new(config: &Config, stores: Stores, renderer: Renderer) -> Self {
        let api = ApiClient::new(config);
        let engine = StreamRunEngine::new(Arc::new(api.clone()), stores.clone())
            .with_finalize_policy(FinalizePolicy::from_config(&config.stream));
        let rest = RestClient::new(api, stores.errors.clone());
        Self {
            stores,
            engine,
            rest,
            renderer,
        }
    }

    async fn run(&self, command: Command) -> Result<(), String> {
        match command {
            // Handled before config is loaded.
            Command::Init { .. } => Ok(()),
            Command::Chat {
                prompt,
                thread,
                session,
                test,
                modules,
                adherence,
            } => {
                self.chat(ChatOptions {
                    prompt,
                    thread,
                    session,
                    test,
                    run_config: if modules.is_empty() {
                        RunConfig::default()
                    } else {
                        RunConfig::for_modules(&modules, adherence)
                    },
                })
                .await
            }
            Command::History { thread } => self.history(&thread).await,
            Command::Sessions { action } => self.sessions(action),
            Command::Constitutions { action } => self.constitutions(action).await,
            Command::Marketplace { limit } => self.marketplace(limit).await,
            Command::Reviews { action } => self.reviews(action).await,
        }
    }

    async fn chat(&self, options: ChatOptions) -> Result<(), String> {
        let sessions = &self.stores.sessions;
        if let Some(id) = &options.session {
            if sessions.ui_session(id).is_none() {
                return Err(format!("unknown session `{id}`"));
            }
            sessions.set_active_session_id(Some(id.clone()));
        }
        if !options.test && sessions.active_session_id().is_none() {
            let id = sessions.create_new_session();
            tracing::info!(session_id = %id, "created session for chat");
        }

        let mut run_config = options.run_config;
        if let Some(thread_id) = &options.thread {
            let loaded = self
                .engine
                .load_history(thread_id)
                .await
                .map_err(|e| format!("failed to load thread {thread_id}: {e}"))?;
            self.file_under_active_session(thread_id);
            if run_config.is_empty() {
                if let Some(previous) = loaded
                    .and_then(|thread| thread.history)
                    .and_then(|history| history.run_config)
                {
                    run_config = previous;
                }
            }
        }

        let start = options
            .thread
            .as_deref()
            .and_then(|id| self.stores.threads.get(id))
            .map(|thread| thread.messages().len())
            .unwrap_or(0);
        let mut printer = StreamPrinter::new(self.renderer, start);
        let mut threads_rx = self.stores.threads.subscribe();
        let mut handle = self
            .engine
            .stream_run(options.prompt, run_config, options.thread, options.test);
        let thread_rx = handle.watch_thread_id();
        let mut stdout = io::stdout();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;
        loop {
            tokio::select! {
                biased;
                _ = &mut ctrl_c => {
                    interrupted = true;
                    break;
                }
                _ = handle.finished() => break,
                changed = threads_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = threads_rx.borrow_and_update().clone();
                    let current = thread_rx.borrow().clone();
                    if let Some(thread) = current.and_then(|id| snapshot.get(&id).cloned()) {
                        printer
                            .update(&mut stdout, thread.messages())
                            .map_err(output_error)?;
                    }
                }
            }
        }
        if interrupted {
            handle.cancel();
            handle.finished().await;
            let _ = self.renderer.warn(&mut io::stderr(), "run cancelled");
        }

        if let Some(thread_id) = handle.thread_id() {
            if let Some(thread) = self.stores.threads.get(&thread_id) {
                printer
                    .finish(&mut stdout, thread.messages())
                    .map_err(output_error)?;
                if let Some(error) = thread.error {
                    let _ = self.renderer.error(&mut io::stderr(), &error);
                }
            }
            eprintln!("thread: {thread_id}");
        }
        match self.stores.errors.get() {
            Some(message) if !interrupted => Err(message),
            _ => Ok(()),
        }
    }

    /// Continuing a thread from the CLI files it under the active session
    /// unless another session already owns it.
    fn file_under_active_session(&self, thread_id: &str) {
        let sessions = &self.stores.sessions;
        let Some(session_id) = sessions.active_session_id() else {
            return;
        };
        match sessions.add_thread_to_session(&session_id, thread_id) {
            Ok(_) => {
                if let Err(e) = sessions.set_active_thread(&session_id, Some(thread_id)) {
                    tracing::warn!(error = %e, "could not select thread");
                }
            }
            Err(e) => tracing::debug!(error = %e, "thread left with its owning session"),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<(), String> {
        let thread = self
            .engine
            .load_history(thread_id)
            .await
            .map_err(|e| format!("failed to load thread {thread_id}: {e}"))?
            .ok_or_else(|| format!("thread {thread_id} is already loading"))?;
        let mut stdout = io::stdout();
        self.renderer
            .transcript(&mut stdout, thread.messages())
            .and_then(|()| stdout.flush())
            .map_err(output_error)
    }

    fn sessions(&self, action: SessionsAction) -> Result<(), String> {
        let sessions = &self.stores.sessions;
        let mut stdout = io::stdout();
        let written = match action {
            SessionsAction::List => self.print_sessions(&mut stdout),
            SessionsAction::New { name } => {
                let id = sessions.create_new_session();
                if let Some(name) = name {
                    sessions.rename_session(&id, &name).map_err(|e| e.to_string())?;
                }
                writeln!(stdout, "{id}")
            }
            SessionsAction::Use { id } => {
                if sessions.ui_session(&id).is_none() {
                    return Err(format!("unknown session `{id}`"));
                }
                sessions.set_active_session_id(Some(id.clone()));
                writeln!(stdout, "active session: {id}")
            }
        };
        written.map_err(output_error)
    }

    fn print_sessions(&self, out: &mut impl Write) -> io::Result<()> {
        let state = self.stores.sessions.snapshot();
        let active = state.active_session_id.as_deref();
        for session in state.ui_sessions.values() {
            let marker = if Some(session.id.as_str()) == active { "*" } else { " " };
            self.renderer
                .heading(out, &format!("{marker} {} ({})", session.name, session.id))?;
            for thread_id in &session.thread_ids {
                let label = if session.active_thread_id.as_ref() == Some(thread_id) {
                    "thread*"
                } else {
                    "thread"
                };
                self.renderer.field(out, label, thread_id)?;
            }
        }
        Ok(())
    }

    async fn constitutions(&self, action: ConstitutionsAction) -> Result<(), String> {
        let mut stdout = io::stdout();
        let written = match action {
            ConstitutionsAction::List => {
                let hierarchy = self.rest.list_constitutions().await.map_err(|e| e.to_string())?;
                hierarchy
                    .flatten()
                    .into_iter()
                    .try_for_each(|info| self.renderer.field(&mut stdout, &info.relative_path, &info.title))
            }
            ConstitutionsAction::Show { path } => {
                let text = self
                    .rest
                    .constitution_content(&path)
                    .await
                    .map_err(|e| e.to_string())?;
                writeln!(stdout, "{text}")
            }
            ConstitutionsAction::Check { file } => {
                let text = read_text_file(&file)?;
                let check = self
                    .rest
                    .check_constitution(&text)
                    .await
                    .map_err(|e| e.to_string())?;
                self.print_check(&mut stdout, &check)
            }
            ConstitutionsAction::Submit {
                file,
                title,
                description,
                email,
                tags,
                private,
                unlisted,
            } => {
                let submission = ConstitutionSubmission {
                    text: read_text_file(&file)?,
                    is_private: private,
                    is_unlisted: unlisted,
                    email,
                    title,
                    description,
                    tags,
                };
                let response = self
                    .rest
                    .submit_constitution(&submission)
                    .await
                    .map_err(|e| e.to_string())?;
                self.print_submission(&mut stdout, &response)
            }
        };
        written.map_err(output_error)
    }

    fn print_check(&self, out: &mut impl Write, check: &SuperegoCheck) -> io::Result<()> {
        self.renderer.heading(out, &format!("score: {}/100", check.score))?;
        for (label, items) in [
            ("issue", &check.issues),
            ("warning", &check.warnings),
            ("recommendation", &check.recommendations),
            ("passed", &check.passed_checks),
        ] {
            for item in items {
                self.renderer.field(out, label, item)?;
            }
        }
        Ok(())
    }

    fn print_submission(&self, out: &mut impl Write, response: &SubmissionResponse) -> io::Result<()> {
        self.renderer.heading(out, &response.message)?;
        self.renderer.field(out, "status", &response.status)?;
        if let Some(id) = &response.submission_id {
            self.renderer.field(out, "submission", id)?;
        }
        if let Some(link) = &response.shareable_link {
            self.renderer.field(out, "link", link)?;
        }
        Ok(())
    }

    async fn marketplace(&self, limit: u32) -> Result<(), String> {
        let entries = self.rest.trending(limit).await.map_err(|e| e.to_string())?;
        self.print_marketplace(&mut io::stdout(), &entries)
            .map_err(output_error)
    }

    fn print_marketplace(&self, out: &mut impl Write, entries: &[TrendingConstitution]) -> io::Result<()> {
        for entry in entries {
            self.renderer
                .heading(out, &format!("{} ({})", entry.title, entry.id))?;
            if let Some(author) = &entry.author {
                self.renderer.field(out, "author", author)?;
            }
            if let Some(score) = entry.trend_score() {
                self.renderer.field(out, "trend", &format!("{score:.2}"))?;
            }
            if !entry.tags.is_empty() {
                self.renderer.field(out, "tags", &entry.tags.join(", "))?;
            }
        }
        Ok(())
    }

    async fn reviews(&self, action: ReviewsAction) -> Result<(), String> {
        let mut stdout = io::stdout();
        let written = match action {
            ReviewsAction::List => {
                let pending = self.rest.pending_reviews().await.map_err(|e| e.to_string())?;
                self.print_reviews(&mut stdout, &pending)
            }
            ReviewsAction::Decide {
                id,
                decision,
                comment,
            } => {
                let status = match decision {
                    Decision::Approve => ReviewStatus::Approved,
                    Decision::Reject => ReviewStatus::Rejected,
                };
                let updated = self
                    .rest
                    .decide_review(&id, status, comment.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                writeln!(stdout, "{} -> {}", updated.id, updated.status)
            }
        };
        written.map_err(output_error)
    }

    fn print_reviews(&self, out: &mut impl Write, pending: &[ReviewSubmission]) -> io::Result<()> {
        for review in pending {
            let title = review.title.as_deref().unwrap_or("(untitled)");
            self.renderer.heading(out, &format!("{title} ({})", review.id))?;
            self.renderer.field(out, "status", &review.status.to_string())?;
            if let Some(check) = &review.superego_result {
                self.renderer
                    .field(out, "superego", &format!("{}/100", check.score))?;
            }
        }
        Ok(())
    }
}

struct ChatOptions {
    prompt: String,
    thread: Option<String>,
    session: Option<String>,
    test: bool,
    run_config: RunConfig,
}

fn output_error(e: io::Error) -> String {
    format!("failed to write output: {e}")
}

fn read_text_file(path: &str) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))
}
