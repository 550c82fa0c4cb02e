//! State-machine driver: a deadline-bounded send/receive loop feeding a
//! state machine to completion (spec §4.J).

use std::time::Instant;

use crate::frame::Transport;
use crate::state_machine::StateMachine;
use crate::Error;

/// Drive `sm` against `transport` until it finishes or `deadline` passes.
///
/// Invariant enforced here (spec §4.J): a state machine emits at most one
/// frame per step — `get_frame_to_send` is asserted idempotent between
/// sends.
pub async fn drive<T, S>(transport: &mut T, sm: &mut S, deadline: Instant) -> Result<(), Error>
where
    T: Transport + ?Sized,
    S: StateMachine + ?Sized,
{
    while !sm.is_finished() {
        if Instant::now() > deadline {
            return Err(Error::Timeout);
        }

        if let Some(frame) = sm.get_frame_to_send()? {
            transport.send(frame).await?;
        }
        debug_assert!(
            sm.get_frame_to_send()?.is_none(),
            "state machine emitted a second frame with no intervening frame_received"
        );

        let frame = transport.receive(Some(deadline)).await?;
        match sm.frame_received(&frame) {
            Ok(_) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
