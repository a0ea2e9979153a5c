//! Equal-power crossfade between an outgoing and an incoming handle.

use std::f32::consts::FRAC_PI_2;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::Channel;
use crate::error::{Error, Result};
use crate::session::StreamHandle;

const MIN_STEPS: u32 = 20;
const FADE_OUT_STEPS: u32 = 10;

/// `(incoming, outgoing)` volumes at `progress` (0.0–1.0) of a fade to `volume`.
pub fn equal_power(progress: f32, volume: f32) -> (f32, f32) {
    let theta = progress.clamp(0.0, 1.0) * FRAC_PI_2;
    (theta.sin() * volume, theta.cos() * volume)
}

pub fn step_count(duration: Duration, step: Duration) -> u32 {
    let by_step = duration.as_millis() / step.as_millis().max(1);
    (by_step as u32).max(MIN_STEPS)
}

/// Run the crossfade.  On cancellation both handles are left where the
/// fade stopped and `TransitionAborted` is returned; the caller decides
/// what to restore.
pub async fn run<C: Channel>(
    incoming: &StreamHandle<C>,
    outgoing: &StreamHandle<C>,
    volume: f32,
    duration: Duration,
    step: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let steps = step_count(duration, step);
    let delay = duration / steps;
    debug!(
        "crossfade: {} -> {} over {:?} in {} steps",
        outgoing.url(),
        incoming.url(),
        duration,
        steps
    );

    for i in 1..=steps {
        let (new, old) = equal_power(i as f32 / steps as f32, volume);
        // A failing outgoing handle must not stall the incoming fade.
        let _ = outgoing.set_volume(old).await;
        incoming.set_volume(new).await?;

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::TransitionAborted { url: incoming.url().to_string() });
            }
            _ = sleep(delay) => {}
        }
    }
    Ok(())
}

/// Linear fade from the handle's current volume to silence, ten steps
/// `step` apart.  Errors are ignored.
pub async fn fade_out<C: Channel>(handle: &StreamHandle<C>, step: Duration) {
    let from = handle.volume();
    if from <= 0.0 {
        return;
    }
    for i in (0..FADE_OUT_STEPS).rev() {
        let level = from * i as f32 / FADE_OUT_STEPS as f32;
        if handle.set_volume(level).await.is_err() {
            break;
        }
        sleep(step).await;
    }
}
