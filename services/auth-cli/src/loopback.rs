//! Loopback browser for OAuth sign-in from the command line
//!
//! Opens the system browser on the authorization URL and listens on
//! 127.0.0.1 for the provider's redirect. The provider puts the tokens in
//! the URL fragment, which browsers never send to a server, so the callback
//! page re-requests itself with the fragment moved into the query string.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use auth_session::{AuthBrowser, BrowserOutcome};
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::response::Html;
use axum::routing::get;
use identity::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FORWARD_FRAGMENT_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Signing in</title></head>
<body>
<p id="status">Completing sign-in...</p>
<script>
if (window.location.hash.length > 1) {
  window.location.replace(window.location.pathname + "?" + window.location.hash.substring(1));
} else {
  document.getElementById("status").textContent = "No sign-in response received. You can close this window.";
}
</script>
</body>
</html>"#;

const DONE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Sign-in complete</title></head>
<body><p>Sign-in finished. You can close this window and return to the terminal.</p></body>
</html>"#;

#[derive(Clone)]
struct CallbackState {
    sender: mpsc::Sender<String>,
    redirect_url: Arc<str>,
}

/// `AuthBrowser` that opens the system browser and catches the redirect on
/// a local port.
pub struct LoopbackBrowser {
    port: u16,
    timeout: Duration,
    launch: bool,
}

impl LoopbackBrowser {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            launch: true,
        }
    }

    /// Print the URL instead of launching a browser.
    pub fn without_launch(mut self) -> Self {
        self.launch = false;
        self
    }

    async fn run(&self, auth_url: &str, redirect_url: &str) -> BrowserOutcome {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => return BrowserOutcome::Other(format!("failed to bind {addr}: {e}")),
        };

        let (sender, mut receiver) = mpsc::channel(1);
        let app = Router::new()
            .route("/auth/callback", get(handle_callback))
            .with_state(CallbackState {
                sender,
                redirect_url: Arc::from(redirect_url),
            });
        let server = tokio::spawn(async move { axum::serve(listener, app).await });
        info!(%addr, "OAuth callback listener ready");

        eprintln!("Open this URL to sign in:\n{auth_url}");
        if self.launch {
            if let Err(e) = webbrowser::open(auth_url) {
                warn!(error = %e, "failed to open browser");
            }
        }

        let outcome = tokio::select! {
            received = receiver.recv() => match received {
                Some(url) => BrowserOutcome::Success { url },
                None => BrowserOutcome::Other("callback listener stopped".into()),
            },
            _ = tokio::signal::ctrl_c() => BrowserOutcome::Cancel,
            _ = tokio::time::sleep(self.timeout) => {
                debug!(timeout_secs = self.timeout.as_secs(), "no OAuth callback received");
                BrowserOutcome::Dismiss
            }
        };

        server.abort();
        outcome
    }
}

impl AuthBrowser for LoopbackBrowser {
    fn open_auth_session<'a>(
        &'a self,
        auth_url: &'a str,
        redirect_url: &'a str,
    ) -> BoxFuture<'a, BrowserOutcome> {
        Box::pin(self.run(auth_url, redirect_url))
    }
}

/// Hand a parameterized callback to the waiting flow; bounce a bare one
/// through the fragment-forwarding page.
async fn handle_callback(
    State(state): State<CallbackState>,
    RawQuery(query): RawQuery,
) -> Html<&'static str> {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => {
            let url = format!("{}?{query}", state.redirect_url);
            // A full channel means a callback already arrived.
            if state.sender.try_send(url).is_err() {
                debug!("ignoring duplicate OAuth callback");
            }
            Html(DONE_PAGE)
        }
        None => Html(FORWARD_FRAGMENT_PAGE),
    }
}
