//! The session as seen by the acquisition scheduler.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::Session;
use crate::error::AppResult;
use crate::hardware::AcquireRequest;
use crate::navigation::PositionListEntry;
use crate::scheduler::{RunContext, RunKind, Visit};
use crate::settings::MotionFrame;

#[async_trait]
impl RunContext for Session {
    async fn visit(&mut self, visit: Option<Visit>, single_volume: bool) -> AppResult<()> {
        if let Some(visit) = visit {
            match visit.focus_z_um {
                Some(target) if target.frame == MotionFrame::Absolute => {
                    self.settings.set_focus_z_um(target.value)
                }
                Some(target) => self.settings.move_focus_by(target.value),
                None => {}
            }
            self.settings.set_xy_mm(visit.xy_mm);
        }
        self.commit_desired(single_volume).await?;
        Ok(())
    }

    async fn capture(&mut self, request: AcquireRequest) -> AppResult<()> {
        self.await_capture().await?;
        let task = self.microscope.acquire(request).await?;
        self.last_capture = Some(task);
        Ok(())
    }

    async fn await_outstanding_capture(&mut self) -> AppResult<()> {
        self.await_capture().await
    }

    async fn finish_all_tasks(&mut self) -> AppResult<()> {
        self.microscope.finish_all_tasks().await
    }

    fn position_entry(&self, index: usize) -> Option<PositionListEntry> {
        self.navigation.positions.get(index)
    }

    fn set_position_cursor(&mut self, position: usize) {
        self.navigation.positions.set_current(position);
    }

    async fn record_position(&mut self) -> AppResult<()> {
        self.append_current_position()
    }

    fn set_survey_location(&mut self, kind: RunKind, location: usize) -> AppResult<()> {
        match kind {
            RunKind::GridPreview => self.navigation.grid.move_to(location).map(drop),
            RunKind::TilePreview => self.navigation.tiles.move_to(location).map(drop),
            RunKind::Acquire => Ok(()),
        }
    }

    async fn buffer_time(&self) -> Duration {
        let status = self.microscope.status().await;
        Duration::try_from_secs_f64(status.buffer_time_s).unwrap_or(Duration::ZERO)
    }

    async fn preview_ready(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn autofocus(&mut self, position: Option<usize>, preview: &Path) -> AppResult<()> {
        // The preview file exists before the capture has finished writing it.
        self.await_capture().await?;
        self.status = self.microscope.status().await;
        let frame = self.microscope.load_preview(preview).await?;
        let z_um = self.estimator.estimate(&frame, &self.status.preview_geometry)?;
        debug!(?position, z_um, "focus estimate");

        let Some(target) =
            self.autofocus
                .observe(position.unwrap_or(0), z_um, self.status.focus_z_um)
        else {
            return Ok(());
        };
        info!(?position, focus_z_um = target.value, "autofocus correction");
        match position {
            Some(index) => self.navigation.positions.set_focus(index, target.value),
            None => self.settings.set_focus_z_um(target.value),
        }
        Ok(())
    }
}
