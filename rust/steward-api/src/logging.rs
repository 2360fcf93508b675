//! Startup logging helpers.
//!
//! [`OpTimer`] measures a phase and logs its duration; the macros give the
//! bootstrap sequence in [`crate::server`] a consistent shape.

use std::time::Instant;

/// Logs the start of an operation and, on finish, its duration.
///
/// ```rust,ignore
/// use steward_api::logging::OpTimer;
///
/// let timer = OpTimer::new("storage", "open_sqlite");
/// let audit = SqliteAuditLog::open(path).await;
/// timer.finish_with_result(audit.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    /// e.g. "storage", "steward".
    component: String,
    operation: String,
    start: Instant,
}

impl OpTimer {
    /// Start timing; logs at debug level.
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();

        tracing::debug!(
            component = %component,
            operation = %operation,
            "Operation started"
        );

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Log the elapsed time.
    pub fn finish(self) {
        let duration_ms = self.start.elapsed().as_millis();

        tracing::info!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = duration_ms,
            "Operation completed"
        );
    }

    /// Log the elapsed time at info level on success, error level with the
    /// error otherwise.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();

        match result {
            Ok(_) => {
                tracing::info!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    "Operation completed successfully"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    error = %e,
                    "Operation failed"
                );
            }
        }
    }
}

/// Log one numbered bootstrap step.
///
/// ```rust,ignore
/// log_init_step!(1, 4, "Storage", "sqlite at /var/lib/steward");
/// log_init_step!(2, 4, "Actors");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {} - {}",
            $step,
            $total,
            $name,
            $detail
        );
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {}",
            $step,
            $total,
            $name
        );
    };
}

/// Log a non-fatal bootstrap problem.
///
/// ```rust,ignore
/// log_init_warning!("Rollback watcher disabled");
/// ```
#[macro_export]
macro_rules! log_init_warning {
    ($msg:expr) => {
        tracing::warn!("⚠️  {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::warn!("⚠️  {}", format!($msg, $($arg)*));
    };
}

/// Log the successful end of a major phase.
#[macro_export]
macro_rules! log_success {
    ($msg:expr) => {
        tracing::info!("✅ {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::info!("✅ {}", format!($msg, $($arg)*));
    };
}

/// Log a boxed banner, e.g. `log_banner!("Steward API v0.1.0", "storage: sqlite")`.
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("");
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("");
    };
    ($title:expr, $subtitle:expr) => {
        tracing::info!("");
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("  {}", $subtitle);
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("");
    };
}
