//! Background delivery of inbound messages to registered handlers.
//!
//! A [`Poller`] drains a socket's inbound message queue and feeds each
//! message to the handlers registered with
//! [`WebSocket::on_message`](crate::WebSocket::on_message). It is the bridge
//! between the pull-style [`WebSocket::receive`](crate::WebSocket::receive)
//! API and event-style consumption; an application uses one or the other,
//! since the poller consumes the messages it delivers.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::websocket::WebSocket;

/// Drains inbound messages into the message event.
pub struct Poller;

impl Poller {
    /// Spawns a polling task for `socket`.
    ///
    /// The task runs until the connection closes or the returned handle
    /// stops it.
    pub fn spawn(socket: Arc<WebSocket>) -> PollerHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.child_token();
            async move { Poller::run(&socket, token).await }
        });
        PollerHandle { token, task }
    }

    /// Polls `socket` on the current task until the connection closes or
    /// `token` fires.
    pub async fn run(socket: &WebSocket, token: CancellationToken) {
        loop {
            match socket.receive_with(&token).await {
                Ok(message) => socket.emit_message(&message),
                Err(_) => break,
            }
        }
    }
}

/// Handle to a spawned [`Poller`] task.
pub struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops the polling task. The socket itself is unaffected.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the polling task has exited, either stopped or because the
    /// connection closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::handshake::Handshake;
    use crate::message::Message;
    use crate::socket::Role;
    use crate::websocket::Options;
    use crate::ConnectionState;

    fn pair() -> (WebSocket, WebSocket) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let options = Options::default().with_close_timeout(Duration::from_millis(200));
        let client = WebSocket::with_stream(
            client_io,
            Role::Client,
            Handshake::Client {
                host: "localhost".into(),
                port: 80,
                path: "/".into(),
            },
            options.clone(),
        );
        let server = WebSocket::with_stream(server_io, Role::Server, Handshake::Server, options);
        (client, server)
    }

    async fn eventually(what: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_poller_delivers_messages_to_handlers() {
        let (client, server) = pair();
        let server = Arc::new(server);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            server.on_message(move |message| seen.lock().unwrap().push(message.clone()));
        }
        let handle = Poller::spawn(Arc::clone(&server));

        client.send_text("first").await.unwrap();
        client.send_text("second").await.unwrap();

        eventually(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Message::text("first"), Message::text("second")]
        );

        handle.stop();
        eventually(|| handle.is_finished()).await;
    }

    #[tokio::test]
    async fn test_poller_finishes_when_connection_closes() {
        let (client, server) = pair();
        let server = Arc::new(server);
        let handle = Poller::spawn(Arc::clone(&server));

        eventually(|| client.state() == ConnectionState::Connected).await;
        client.close();
        eventually(|| handle.is_finished()).await;
    }

    #[tokio::test]
    async fn test_stopped_poller_leaves_socket_usable() {
        let (client, server) = pair();
        let server = Arc::new(server);
        let handle = Poller::spawn(Arc::clone(&server));

        eventually(|| server.state() == ConnectionState::Connected).await;
        handle.stop();
        eventually(|| handle.is_finished()).await;

        // Messages now buffer for direct receives instead.
        client.send_text("direct").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Message::text("direct"));
    }
}
