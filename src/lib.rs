pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod extractor;
pub mod launcher;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod types;

#[cfg(feature = "desktop")]
pub mod commands;
#[cfg(feature = "desktop")]
pub mod desktop;

pub use config::OrchestratorConfig;
pub use error::RunError;
pub use registry::RunRegistry;
pub use types::{RunParams, RunSnapshot, RunStats, RunStatus};

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Arc;

    use tauri::Manager;

    tauri::Builder::default()
        .plugin(tauri_plugin_shell::init())
        .setup(|app| {
            let config = OrchestratorConfig::from_env()?;
            let observer = desktop::WindowObserver::new(app.handle().clone());
            app.manage(RunRegistry::with_observer(config, Arc::new(observer)));
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::run::create_run,
            commands::run::stop_run,
            commands::query::get_run_status,
            commands::query::list_runs,
        ])
        .run(tauri::generate_context!())
        .expect("error running tauri application");
}
