//! Drive concurrent traffic through a runtime and report what happened.

use anyhow::{anyhow, bail, Context, Result};
use lifescope::{
    AttributeValue, CallbackError, GlobalScope, LifecycleListener, ListenerResult,
    MetricsSnapshot, Runtime, RuntimeConfig, Scope, ScopeKind, SessionScope, Singleton,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub threads: usize,
    pub requests: usize,
    pub sessions: usize,
    pub applications: usize,
    pub renew_every: Option<usize>,
}

#[derive(Serialize)]
struct SimulationReport {
    threads: usize,
    requests_per_thread: usize,
    total_requests: usize,
    elapsed_ms: u64,
    live_sessions_at_shutdown: usize,
    metrics: MetricsSnapshot,
}

/// Per-scope request counter, one instance per application and per session
#[derive(Default)]
struct HitCounter {
    hits: AtomicU64,
}

impl HitCounter {
    fn hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Singleton for HitCounter {
    fn post_construct(&self, scope: &dyn Scope) -> Result<(), CallbackError> {
        tracing::debug!(kind = %scope.kind(), scope = %scope.id(), "Hit counter created");
        Ok(())
    }
}

/// Mirrors coarse transitions into the log
struct TracingListener;

impl LifecycleListener for TracingListener {
    fn name(&self) -> &str {
        "tracing"
    }

    fn global_began(&self, scope: &GlobalScope) -> ListenerResult {
        tracing::info!(scope = %scope.id(), "Global scope began");
        Ok(())
    }

    fn global_ending(&self, scope: &GlobalScope) -> ListenerResult {
        tracing::info!(scope = %scope.id(), "Global scope ending");
        Ok(())
    }

    fn session_began(&self, scope: &SessionScope) -> ListenerResult {
        tracing::debug!(session = %scope.id(), "Session began");
        Ok(())
    }

    fn session_ending(&self, scope: &SessionScope) -> ListenerResult {
        tracing::debug!(session = %scope.id(), "Session ending");
        Ok(())
    }
}

fn validate(options: &SimulateOptions) -> Result<()> {
    if options.threads == 0 {
        bail!("--threads must be at least 1");
    }
    if options.sessions == 0 {
        bail!("--sessions must be at least 1");
    }
    if options.applications == 0 {
        bail!("--applications must be at least 1");
    }
    if options.renew_every == Some(0) {
        bail!("--renew-every must be at least 1");
    }
    Ok(())
}

/// One worker: a fixed pool of sessions, cycled request by request
fn run_worker(runtime: &Runtime, worker: usize, options: &SimulateOptions) -> Result<()> {
    let mut sessions: Vec<String> = (0..options.sessions)
        .map(|slot| format!("session-{}-{}", worker, slot))
        .collect();

    for k in 0..options.requests {
        let slot = k % options.sessions;
        let application = format!("app-{}", k % options.applications);
        let request_id = format!("request-{}-{}", worker, k);

        runtime.begin_request(&application, &request_id, Some(sessions[slot].as_str()))?;

        runtime
            .singleton::<HitCounter>(ScopeKind::Application)?
            .hit();
        let session_hits = runtime.singleton::<HitCounter>(ScopeKind::Session)?.hit();

        let session = runtime
            .session_scope(true)?
            .ok_or_else(|| anyhow!("request {} has no session", request_id))?;
        session.set(
            "user",
            AttributeValue::new(format!("user-{}-{}", worker, slot)).surviving_renewal(),
        )?;
        session.set("session_hits", AttributeValue::new(session_hits))?;
        if let Some(scope) = runtime.current_session_application_scope(true)? {
            scope.set("last_request", AttributeValue::new(k).surviving_renewal())?;
        }

        if let Some(every) = options.renew_every {
            if (k + 1) % every == 0 {
                let renewed = runtime.renew_session()?;
                tracing::debug!(old = %sessions[slot], new = %renewed.id(), "Session renewed");
                sessions[slot] = renewed.id().to_string();
            }
        }

        runtime.end_request()?;
    }
    Ok(())
}

/// Run the simulation and print a report.
pub fn simulate(config: RuntimeConfig, options: &SimulateOptions, json: bool) -> Result<()> {
    validate(options)?;

    let runtime = Runtime::builder()
        .config(config)
        .listener(TracingListener)
        .build()
        .context("Failed to build runtime")?;
    runtime.begin_global()?;
    runtime.register_singleton(ScopeKind::Application, HitCounter::default);
    runtime.register_singleton(ScopeKind::Session, HitCounter::default);

    let started = Instant::now();
    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..options.threads)
            .map(|worker| {
                let runtime = &runtime;
                s.spawn(move || run_worker(runtime, worker, options))
            })
            .collect();
        for (worker, handle) in handles.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| anyhow!("worker {} panicked", worker))?
                .with_context(|| format!("worker {} failed", worker))?;
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();

    let live_sessions = runtime.session_registry()?.len();
    runtime.shutdown().context("Failed to shut down runtime")?;

    let report = SimulationReport {
        threads: options.threads,
        requests_per_thread: options.requests,
        total_requests: options.threads * options.requests,
        elapsed_ms: elapsed.as_millis() as u64,
        live_sessions_at_shutdown: live_sessions,
        metrics: runtime.metrics().snapshot(),
    };

    if json {
        let payload = serde_json::to_string_pretty(&report)?;
        println!("{}", payload);
    } else {
        println!(
            "Simulation complete: {} requests on {} threads in {} ms, {} live sessions at shutdown",
            report.total_requests, report.threads, report.elapsed_ms, report.live_sessions_at_shutdown
        );
        println!();
        print!("{}", report.metrics.format_report());
    }

    Ok(())
}
