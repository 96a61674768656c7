// SPDX-License-Identifier: Apache-2.0

//! Errors for the runtime crate.

/// Errors that can occur while starting or driving the runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wrapper for configuration errors.
    #[error("A configuration error occurred: {0}")]
    ConfigError(#[from] taskmill_config::Error),

    /// Failed to spawn a worker OS thread.
    #[error("Failed to spawn thread '{thread_name}': {source}")]
    ThreadSpawnError {
        /// Name of the thread we attempted to spawn.
        thread_name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked and was joined with an error.
    #[error("Worker thread '{thread_name}' panicked: {panic_message}")]
    WorkerPanic {
        /// Name of the worker thread.
        thread_name: String,
        /// Panic payload, formatted.
        panic_message: String,
    },

    /// The runtime was asked to start while already running.
    #[error("The runtime is already running")]
    AlreadyRunning,
}
