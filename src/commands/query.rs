use tauri::State;

use crate::registry::RunRegistry;
use crate::types::{RunSnapshot, RunSummary};

#[tauri::command]
pub async fn get_run_status(
    registry: State<'_, RunRegistry>,
    run_id: String,
) -> Result<RunSnapshot, String> {
    registry.get_run(&run_id).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn list_runs(registry: State<'_, RunRegistry>) -> Result<Vec<RunSummary>, String> {
    Ok(registry.list_runs())
}
