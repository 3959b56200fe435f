use tauri::State;

use crate::registry::RunRegistry;
use crate::types::{CreatedRun, RunParams, StopReceipt};

#[tauri::command]
pub async fn create_run(
    registry: State<'_, RunRegistry>,
    sim_time: u32,
    min_green: u32,
    max_green: u32,
) -> Result<CreatedRun, String> {
    let params = RunParams {
        sim_time,
        min_green,
        max_green,
    };
    registry.create_run(params).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn stop_run(
    registry: State<'_, RunRegistry>,
    run_id: String,
) -> Result<StopReceipt, String> {
    registry.stop_run(&run_id).await.map_err(|e| e.to_string())
}
