//! Default relay handler: forwards inbound messages to the connections of
//! the recipient named by `message_dim`.

use async_trait::async_trait;

use wirebus_core::error::Result;
use wirebus_core::protocol::Envelope;

use crate::dispatch::{MessageHandler, ServerCtx};

/// Makes the server behave as a bus out of the box: anything a client
/// sends is routed onward. Register as the default handler, or per
/// segment type for selective relaying.
#[derive(Debug, Default)]
pub struct RelayHandler;

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(&self, ctx: ServerCtx, env: Envelope) -> Result<()> {
        let results = ctx.routing().send(&env).await;
        let delivered = results.values().filter(|ok| **ok).count();
        tracing::debug!(
            msg_id = %env.msg_id,
            from = %ctx.user_id,
            delivered,
            attempted = results.len(),
            "relayed message"
        );
        Ok(())
    }
}
