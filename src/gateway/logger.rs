use std::time::Instant;

use salvo::http::{Request, Response, StatusCode};
use salvo::{Depot, FlowCtrl, Handler, async_trait};

/// One log line per API request: method, path, status, latency.
///
/// Server-side failures get a `warn` so a misbehaving worker or a lost hub
/// connection stands out without raising the level on the happy path.
pub struct RequestLog;

#[async_trait]
impl Handler for RequestLog {
    async fn handle(
        &self,
        req: &mut Request,
        depot: &mut Depot,
        res: &mut Response,
        ctrl: &mut FlowCtrl,
    ) {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let started = Instant::now();

        ctrl.call_next(req, depot, res).await;

        let status =
            res.status_code.unwrap_or(StatusCode::OK).as_u16();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if status >= 500 {
            tracing::warn!(%method, %path, status, elapsed_ms, "Api request failed");
        } else {
            tracing::info!(%method, %path, status, elapsed_ms, "Api request");
        }
    }
}
