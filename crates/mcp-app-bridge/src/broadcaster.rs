//! Host context broadcaster.

use std::fmt;

use crate::envelope::{MessageEnvelope, params_from};
use crate::types::{HostContext, HostContextPatch, SizeChangedParams, Theme, methods};

/// Frame size the guest asked the host to give it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizeRequest {
    pub height: u32,
    pub width: Option<u32>,
}

pub type SizeRequestCallback = Box<dyn FnMut(FrameSizeRequest) + Send>;

/// Tracks host environment signals for one session and turns changes into
/// `host-context-changed` notifications once the guest is initialized.
pub struct HostContextBroadcaster {
    context: HostContext,
    last_sent_size: Option<(u32, u32)>,
    last_sent_theme: Option<Theme>,
    observing: bool,
    on_size_request: Option<SizeRequestCallback>,
}

impl fmt::Debug for HostContextBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContextBroadcaster")
            .field("context", &self.context)
            .field("last_sent_size", &self.last_sent_size)
            .field("last_sent_theme", &self.last_sent_theme)
            .field("observing", &self.observing)
            .finish_non_exhaustive()
    }
}

impl HostContextBroadcaster {
    pub fn new(context: HostContext) -> Self {
        Self {
            context,
            last_sent_size: None,
            last_sent_theme: None,
            observing: false,
            on_size_request: None,
        }
    }

    pub fn set_size_request_callback(&mut self, callback: SizeRequestCallback) {
        self.on_size_request = Some(callback);
    }

    pub fn start(&mut self) {
        self.observing = true;
    }

    /// Idempotent; a stopped broadcaster never emits.
    pub fn stop(&mut self) {
        self.observing = false;
    }

    /// Forget what was sent to the previous guest document.
    pub fn reset(&mut self) {
        self.last_sent_size = None;
        self.last_sent_theme = None;
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Builds the snapshot returned by `ui/initialize`. The size it reports
    /// counts as already sent.
    pub fn initialize_snapshot(&mut self) -> HostContext {
        self.last_sent_size = Some((self.context.viewport.width, self.context.viewport.height));
        self.last_sent_theme = Some(self.context.theme);
        self.context.clone()
    }

    pub fn theme_changed(
        &mut self,
        theme: Theme,
        initialized: bool,
    ) -> Result<Option<MessageEnvelope>, serde_json::Error> {
        let previous = std::mem::replace(&mut self.context.theme, theme);
        if previous != theme {
            tracing::debug!(theme = theme.label(), "Host theme changed");
        }
        if !(initialized && self.observing) || self.last_sent_theme.unwrap_or(previous) == theme {
            return Ok(None);
        }
        self.last_sent_theme = Some(theme);
        patch_notification(&HostContextPatch {
            theme: Some(theme),
            ..HostContextPatch::default()
        })
        .map(Some)
    }

    /// Called once the guest reports `initialized`. Anything that changed
    /// after the `ui/initialize` snapshot went out is sent as one patch.
    /// Without a snapshot there is no baseline and nothing is sent.
    pub fn catch_up(&mut self) -> Result<Option<MessageEnvelope>, serde_json::Error> {
        if !self.observing {
            return Ok(None);
        }
        let theme = self.context.theme;
        let size = (self.context.viewport.width, self.context.viewport.height);
        let mut patch = HostContextPatch::default();
        if self.last_sent_theme.is_some_and(|sent| sent != theme) {
            self.last_sent_theme = Some(theme);
            patch.theme = Some(theme);
        }
        if self.last_sent_size.is_some_and(|sent| sent != size) {
            self.last_sent_size = Some(size);
            patch.viewport = Some(self.context.viewport);
        }
        if patch == HostContextPatch::default() {
            return Ok(None);
        }
        patch_notification(&patch).map(Some)
    }

    /// Records the host window's maximum viewport. Reported with the next
    /// frame measurement rather than on its own.
    pub fn host_viewport_changed(&mut self, max_width: f64, max_height: f64) {
        self.context.viewport.max_width = Some(round_dimension(max_width));
        self.context.viewport.max_height = Some(round_dimension(max_height));
    }

    pub fn frame_resized(
        &mut self,
        width: f64,
        height: f64,
        initialized: bool,
    ) -> Result<Option<MessageEnvelope>, serde_json::Error> {
        let size = (round_dimension(width), round_dimension(height));
        self.context.viewport.width = size.0;
        self.context.viewport.height = size.1;

        if !(initialized && self.observing) || self.last_sent_size == Some(size) {
            return Ok(None);
        }
        self.last_sent_size = Some(size);
        patch_notification(&HostContextPatch {
            viewport: Some(self.context.viewport),
            ..HostContextPatch::default()
        })
        .map(Some)
    }

    pub fn guest_size_changed(&mut self, params: &SizeChangedParams) {
        if !self.observing {
            return;
        }
        let request = FrameSizeRequest {
            height: round_dimension(params.height),
            width: params.width.map(round_dimension),
        };
        if let Some(callback) = self.on_size_request.as_mut() {
            callback(request);
        } else {
            tracing::debug!(height = request.height, "Guest size request without host callback");
        }
    }
}

fn patch_notification(patch: &HostContextPatch) -> Result<MessageEnvelope, serde_json::Error> {
    Ok(MessageEnvelope::notification(
        methods::HOST_CONTEXT_CHANGED,
        params_from(patch)?,
    ))
}

fn round_dimension(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    fn started() -> HostContextBroadcaster {
        let mut broadcaster = HostContextBroadcaster::new(HostContext::default());
        broadcaster.start();
        broadcaster
    }

    #[test]
    fn nothing_is_emitted_before_initialization() -> anyhow::Result<()> {
        let mut broadcaster = started();
        assert!(broadcaster.frame_resized(300.0, 200.0, false)?.is_none());
        assert!(broadcaster.theme_changed(Theme::Dark, false)?.is_none());
        assert_eq!(broadcaster.context().theme, Theme::Dark);
        assert_eq!(broadcaster.context().viewport.width, 300);
        Ok(())
    }

    #[test]
    fn identical_rounded_sizes_emit_once() -> anyhow::Result<()> {
        let mut broadcaster = started();
        let first = broadcaster.frame_resized(300.2, 199.6, true)?;
        let second = broadcaster.frame_resized(299.8, 200.4, true)?;
        assert!(first.is_some());
        assert!(second.is_none());

        let value = first.map(|envelope| envelope.to_value());
        assert_eq!(
            value,
            Some(json!({
                "jsonrpc": "2.0",
                "method": "ui/notifications/host-context-changed",
                "params": {"viewport": {"width": 300, "height": 200}}
            }))
        );
        Ok(())
    }

    #[test]
    fn initialize_snapshot_counts_as_sent() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.frame_resized(640.0, 480.0, false)?;
        let snapshot = broadcaster.initialize_snapshot();
        assert_eq!(snapshot.viewport.width, 640);
        assert!(broadcaster.frame_resized(640.0, 480.0, true)?.is_none());
        assert!(broadcaster.frame_resized(640.0, 481.0, true)?.is_some());
        Ok(())
    }

    #[test]
    fn host_maximums_ride_along_with_next_resize() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.host_viewport_changed(1440.0, 900.0);
        let sent = broadcaster.frame_resized(400.0, 300.0, true)?;
        let value = sent.map(|envelope| envelope.to_value());
        assert_eq!(
            value.as_ref().map(|value| &value["params"]["viewport"]),
            Some(&json!({"width": 400, "height": 300, "maxWidth": 1440, "maxHeight": 900}))
        );
        Ok(())
    }

    #[test]
    fn theme_change_emits_only_on_difference() -> anyhow::Result<()> {
        let mut broadcaster = started();
        assert!(broadcaster.theme_changed(Theme::Light, true)?.is_none());
        let sent = broadcaster.theme_changed(Theme::Dark, true)?;
        assert_eq!(
            sent.map(|envelope| envelope.to_value()["params"].clone()),
            Some(json!({"theme": "dark"}))
        );
        Ok(())
    }

    #[test]
    fn changes_between_snapshot_and_initialized_are_caught_up() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.frame_resized(640.0, 480.0, false)?;
        broadcaster.initialize_snapshot();
        assert!(broadcaster.theme_changed(Theme::Dark, false)?.is_none());
        broadcaster.frame_resized(800.0, 480.0, false)?;

        let sent = broadcaster.catch_up()?;
        assert_eq!(
            sent.map(|envelope| envelope.to_value()["params"].clone()),
            Some(json!({"theme": "dark", "viewport": {"width": 800, "height": 480}}))
        );
        assert!(broadcaster.catch_up()?.is_none());
        assert!(broadcaster.theme_changed(Theme::Dark, true)?.is_none());
        assert!(broadcaster.frame_resized(800.0, 480.0, true)?.is_none());
        Ok(())
    }

    #[test]
    fn theme_flip_back_before_initialized_needs_no_catch_up() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.initialize_snapshot();
        broadcaster.theme_changed(Theme::Dark, false)?;
        broadcaster.theme_changed(Theme::Light, false)?;
        assert!(broadcaster.catch_up()?.is_none());
        Ok(())
    }

    #[test]
    fn catch_up_without_snapshot_sends_nothing() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.theme_changed(Theme::Dark, false)?;
        broadcaster.frame_resized(320.0, 200.0, false)?;
        assert!(broadcaster.catch_up()?.is_none());
        Ok(())
    }

    #[test]
    fn stopped_broadcaster_is_silent() -> anyhow::Result<()> {
        let mut broadcaster = started();
        broadcaster.stop();
        broadcaster.stop();
        assert!(broadcaster.frame_resized(10.0, 10.0, true)?.is_none());
        assert!(broadcaster.theme_changed(Theme::Dark, true)?.is_none());
        Ok(())
    }

    #[test]
    fn guest_size_requests_reach_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut broadcaster = started();
        broadcaster.set_size_request_callback(Box::new(move |request: FrameSizeRequest| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(request);
            }
        }));

        broadcaster.guest_size_changed(&SizeChangedParams {
            height: 120.4,
            width: None,
        });

        let seen = seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(
            seen,
            vec![FrameSizeRequest {
                height: 120,
                width: None
            }]
        );
    }
}
