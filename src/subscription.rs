//! Scoped ownership of an active subscription.
//!
//! Every subscription in this layer rides on a duplicated connection (one
//! connection cannot both block on messages and issue commands), which makes
//! subscriptions the one resource requiring explicit release. A
//! [`Subscription`] owns that connection together with the delivery task;
//! [`Subscription::close`] is the orderly teardown, and dropping the value
//! tears everything down too, so leaking a connection requires keeping the
//! `Subscription` alive on purpose.

use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::Connection;

/// A live subscription: duplicated connection plus delivery task.
///
/// Hold on to it for as long as callbacks should keep firing. Once it is
/// closed (or dropped), no further callbacks run and the manager's
/// connection count returns to its previous value.
#[must_use = "dropping a Subscription tears it down immediately"]
pub struct Subscription {
    conn: Option<Connection>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(conn: Connection, task: JoinHandle<()>) -> Self {
        Self {
            conn: Some(conn),
            task: Some(task),
        }
    }

    /// Stop delivery and release the duplicated connection.
    ///
    /// Waits for the delivery task to wind down before returning, so no
    /// callback invocation can race past this call.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancellation errors are the expected outcome of abort.
            let _ = task.await;
        }
        self.conn.take();
        debug!("subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
