use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::identity::ImageId;

pub(crate) type Completion = oneshot::Sender<Result<Bytes, PipelineError>>;

/// Identifies one waiter on a pending request, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterToken(pub(crate) u64);

enum TicketState {
    Ready(Result<Bytes, PipelineError>),
    Waiting(oneshot::Receiver<Result<Bytes, PipelineError>>),
}

/// Handle on the eventual result of a load request.
///
/// Every ticket for the same identity resolves with the same payload (or
/// the same error). A ticket whose waiter was cancelled resolves with
/// [`PipelineError::Cancelled`].
///
/// Dropping a ticket withdraws its waiter, the same as cancelling it. A
/// queued request nobody holds a ticket for is never dispatched, and the
/// result of an in-flight one is discarded unless the policy caches
/// discarded results. Detached requests (prefetch) are
/// the exception and only go away on an explicit cancel.
pub struct LoadTicket {
    id: ImageId,
    token: Option<WaiterToken>,
    state: TicketState,
}

impl LoadTicket {
    pub(crate) fn waiting(
        id: ImageId,
        token: WaiterToken,
        receiver: oneshot::Receiver<Result<Bytes, PipelineError>>,
    ) -> Self {
        Self {
            id,
            token: Some(token),
            state: TicketState::Waiting(receiver),
        }
    }

    /// A ticket that was satisfied without queueing (a cache hit).
    pub(crate) fn ready(id: ImageId, payload: Bytes) -> Self {
        Self {
            id,
            token: None,
            state: TicketState::Ready(Ok(payload)),
        }
    }

    pub fn id(&self) -> &ImageId {
        &self.id
    }

    /// The waiter token to pass to `cancel`. `None` for tickets that were
    /// resolved immediately.
    pub fn token(&self) -> Option<WaiterToken> {
        self.token
    }

    /// Whether the ticket was resolved without touching any pool.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TicketState::Ready(_))
    }

    pub async fn wait(self) -> Result<Bytes, PipelineError> {
        match self.state {
            TicketState::Ready(result) => result,
            TicketState::Waiting(receiver) => receiver
                .await
                .unwrap_or(Err(PipelineError::Cancelled(self.id))),
        }
    }
}

impl std::fmt::Debug for LoadTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTicket")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("ready", &self.is_ready())
            .finish()
    }
}
