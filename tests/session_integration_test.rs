//! End-to-end session tests against the simulated microscope.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scope_daq::config::ScopeConfig;
use scope_daq::hardware::mock::{MockCall, MockMicroscope};
use scope_daq::hardware::AcquireRequest;
use scope_daq::mode::RunningMode;
use scope_daq::navigation::{GridSpec, FOCUS_LOG_FILE};
use scope_daq::scheduler::TIMING_RECORD_FILE;
use scope_daq::session::RunOptions;
use scope_daq::settings::SettingsEdit;
use scope_daq::{spawn_session, DaqError, Session, SessionHandle, SessionRequest};
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn config(dir: &TempDir) -> ScopeConfig {
    let mut config = ScopeConfig::default();
    config.application.session_root = dir.path().to_path_buf();
    config
}

async fn spawn(config: ScopeConfig, scope: &MockMicroscope) -> (SessionHandle, JoinHandle<()>) {
    spawn_session(config, Arc::new(scope.clone())).await.unwrap()
}

/// Wait until no acquisition or survey is running.
async fn wait_for_run_end(handle: &SessionHandle) {
    let mut modes = handle.subscribe_mode().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), modes.wait_for(|s| !s.mode.is_run()))
        .await
        .expect("run did not end")
        .unwrap();
}

fn captures_in(captures: &[AcquireRequest], suffix: &str) -> Vec<String> {
    captures
        .iter()
        .filter(|r| {
            r.folder
                .as_deref()
                .and_then(Path::to_str)
                .is_some_and(|f| f.ends_with(suffix))
        })
        .filter_map(|r| r.filename.clone())
        .collect()
}

async fn add_position(handle: &SessionHandle, xy_mm: (f64, f64), z_um: f64) {
    handle
        .request(SessionRequest::SetXy { xy_mm })
        .await
        .unwrap();
    handle
        .request(SessionRequest::SetFocus { z_um })
        .await
        .unwrap();
    handle
        .request(SessionRequest::SaveVolumeAndPosition)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_position_list_acquisition() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let (handle, task) = spawn(config(&dir), &scope).await;

    add_position(&handle, (1.0, 2.0), 40.0).await;
    add_position(&handle, (1.5, 2.0), 45.0).await;
    handle
        .request(SessionRequest::SetRunOptions(RunOptions {
            acquire_number: 3,
            loop_over_position_list: true,
            label: "loop".into(),
            description: "two wells".into(),
            ..RunOptions::default()
        }))
        .await
        .unwrap();

    handle.start_acquire().await.unwrap();
    wait_for_run_end(&handle).await;

    let captures = scope.captures().await;
    assert_eq!(
        captures_in(&captures, "_loop_acquire"),
        [
            "000000_p000000.tif",
            "000000_p000001.tif",
            "000001_p000000.tif",
            "000001_p000001.tif",
            "000002_p000000.tif",
            "000002_p000001.tif",
        ]
    );
    let last = captures.last().unwrap();
    assert_eq!(last.description.as_deref(), Some("two wells"));
    assert!(!last.preview_only);

    let folder = last.folder.clone().unwrap();
    assert!(folder.join("data").join("000002_p000001.tif").exists());
    assert_eq!(
        std::fs::read_to_string(folder.join(TIMING_RECORD_FILE)).unwrap(),
        "gui_delay_s: 0\n"
    );

    let status = handle.status().await.unwrap();
    assert_eq!(status.mode.mode, RunningMode::Scout);
    assert!(status.run.is_none());
    assert_eq!(status.positions.total, 2);
    assert_eq!(status.instrument.xy_mm, (1.5, 2.0));
    assert!(scope.calls().await.contains(&MockCall::FinishAllTasks));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_acquisition() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::with_capture_time(Duration::from_millis(40));
    let (handle, task) = spawn(config(&dir), &scope).await;

    handle
        .request(SessionRequest::SetRunOptions(RunOptions {
            acquire_number: 1000,
            ..RunOptions::default()
        }))
        .await
        .unwrap();
    handle.start_acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let refused = handle
        .request(SessionRequest::EditSettings(SettingsEdit::HeightPx(100)))
        .await
        .unwrap_err();
    assert!(matches!(
        refused,
        DaqError::RunActive {
            active: RunningMode::Acquire
        }
    ));

    handle.cancel().await.unwrap();
    wait_for_run_end(&handle).await;

    let saved = captures_in(&scope.captures().await, "_acquire").len();
    assert!(saved > 0 && saved < 1000, "saved {} volumes", saved);
    let status = handle.status().await.unwrap();
    assert!(status.run.is_none());
    assert!(!status.mode.cancel_requested);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_during_delay_returns_at_once() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let (handle, task) = spawn(config(&dir), &scope).await;

    handle
        .request(SessionRequest::SetRunOptions(RunOptions {
            acquire_number: 3,
            delay_s: 60.0,
            ..RunOptions::default()
        }))
        .await
        .unwrap();
    handle.start_acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle.cancel().await.unwrap();
    let mut modes = handle.subscribe_mode().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), modes.wait_for(|s| !s.mode.is_run()))
        .await
        .expect("cancel waited for the delay")
        .unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.mode.mode, RunningMode::Scout);
    assert!(status.run.is_none());
    assert_eq!(captures_in(&scope.captures().await, "_acquire"), ["000000.tif"]);
    handle
        .request(SessionRequest::EditSettings(SettingsEdit::HeightPx(100)))
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_autofocus_reads_complete_previews() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    scope
        .set_preview_write_pause(Some(Duration::from_millis(150)))
        .await;
    let (handle, task) = spawn(config(&dir), &scope).await;

    handle
        .request(SessionRequest::SetRunOptions(RunOptions {
            acquire_number: 2,
            autofocus: true,
            ..RunOptions::default()
        }))
        .await
        .unwrap();
    handle.start_acquire().await.unwrap();
    wait_for_run_end(&handle).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.last_error, None);
    assert_eq!(
        captures_in(&scope.captures().await, "_acquire"),
        ["000000.tif", "000001.tif"]
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_grid_preview_visits_every_cell() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let (handle, task) = spawn(config(&dir), &scope).await;

    let spec = GridSpec::new(2, 2, 500).unwrap();
    handle
        .request(SessionRequest::CreateGrid(spec))
        .await
        .unwrap();
    handle
        .request(SessionRequest::LocateGrid { cell: 0 })
        .await
        .unwrap();
    handle
        .request(SessionRequest::StartGridPreview)
        .await
        .unwrap();
    wait_for_run_end(&handle).await;

    let captures = scope.captures().await;
    assert_eq!(captures_in(&captures, "_grid"), ["A1.tif", "A2.tif", "B1.tif", "B2.tif"]);
    assert!(captures.iter().rev().take(4).all(|r| r.preview_only));

    let status = handle.status().await.unwrap();
    assert_eq!(status.positions.total, 0);
    assert!(status.grid.located);
    // B2 is one column towards -X and one row towards +Y of A1.
    assert_eq!(status.instrument.xy_mm, (-0.5, 0.5));
    assert_eq!(status.grid.location, Some(3));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_tile_preview_saves_positions() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let (handle, task) = spawn(config(&dir), &scope).await;

    handle
        .request(SessionRequest::SetRunOptions(RunOptions {
            save_survey_data: true,
            ..RunOptions::default()
        }))
        .await
        .unwrap();
    handle
        .request(SessionRequest::StartTilePreview { size: 2 })
        .await
        .unwrap();
    wait_for_run_end(&handle).await;

    let captures = scope.captures().await;
    assert_eq!(
        captures_in(&captures, "_tile"),
        ["r0c0.tif", "r0c1.tif", "r1c0.tif", "r1c1.tif"]
    );
    assert!(captures.iter().rev().take(4).all(|r| !r.preview_only));

    let status = handle.status().await.unwrap();
    assert_eq!(status.positions.total, 4);
    assert!(status.tiles.created);
    assert_eq!(status.tiles.location, Some(3));
    let focus_log = std::fs::read_to_string(status.session_folder.join(FOCUS_LOG_FILE)).unwrap();
    assert_eq!(focus_log.lines().count(), 5);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_missing_preview_times_out_and_aborts_run() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.timing.preview_timeout_s = 1;
    let scope = MockMicroscope::new();
    scope.set_write_previews(false).await;
    let (handle, task) = spawn(config, &scope).await;

    handle
        .request(SessionRequest::CreateGrid(GridSpec::default()))
        .await
        .unwrap();
    handle
        .request(SessionRequest::LocateGrid { cell: 0 })
        .await
        .unwrap();
    handle
        .request(SessionRequest::StartGridPreview)
        .await
        .unwrap();
    wait_for_run_end(&handle).await;

    let status = handle.status().await.unwrap();
    assert!(status.run.is_none());
    let error = status.last_error.unwrap();
    assert!(error.contains("A1.tif"), "unexpected error: {}", error);
    assert_eq!(captures_in(&scope.captures().await, "_grid").len(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_restore_metadata_updates_desired_settings() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let (handle, task) = spawn(config(&dir), &scope).await;

    let path = dir.path().join("metadata.txt");
    std::fs::write(
        &path,
        "channels_per_slice: ('488',)\n\
         power_per_channel: (12,)\n\
         emission_filter: ET525/50M\n\
         illumination_time_us: 2000\n\
         height_px: 100\n\
         width_px: 400\n\
         voxel_aspect_ratio: 10.2\n\
         scan_range_um: 20.0\n\
         volumes_per_buffer: 2\n",
    )
    .unwrap();
    handle
        .request(SessionRequest::RestoreMetadata { path })
        .await
        .unwrap();

    let desired = handle.status().await.unwrap().desired;
    assert_eq!(desired.powers, vec![12.0]);
    assert_eq!((desired.height_px, desired.width_px), (100, 400));
    assert_eq!(desired.voxel_aspect_ratio, 10);
    assert_eq!(desired.volumes_per_buffer, 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Steps a run by hand so the sample can drift between iterations.
#[tokio::test]
async fn test_autofocus_corrects_drift() {
    let dir = TempDir::new().unwrap();
    let scope = MockMicroscope::new();
    let mut session = Session::start(config(&dir), Arc::new(scope.clone()))
        .await
        .unwrap();
    session
        .set_run_options(RunOptions {
            acquire_number: 2,
            autofocus: true,
            ..RunOptions::default()
        })
        .unwrap();
    session.start_acquire().unwrap();
    let generation = session.take_tick_request().unwrap();

    let mut drifted = false;
    for _ in 0..1000 {
        let next = session.mode_tick(generation).await.unwrap();
        if !drifted && session.run_state().is_some_and(|r| r.iteration_count == 1) {
            scope.set_sample_offset_rows(10.0).await;
            drifted = true;
        }
        if next.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(drifted);
    assert_eq!(session.modes().active(), RunningMode::Scout);
    let focus = session.settings().focus_z_um().unwrap();
    assert!((focus - 110.0).abs() < 0.5, "focus corrected to {}", focus);
}
