//! ControlService gRPC implementation.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use rproxy_proto::v1::control_service_server::ControlService;
use rproxy_proto::v1::{CreateRequest, Empty, Report, SessionInfo};

use crate::error::ReflectorError;
use crate::reflector::Reflector;
use crate::server::grpc_util::is_peer_disconnect;
use crate::session;

type CreateRequestStream = Pin<Box<dyn Stream<Item = Result<CreateRequest, Status>> + Send>>;

pub struct ControlServiceImpl {
    reflector: Arc<Reflector>,
}

impl ControlServiceImpl {
    pub const fn new(reflector: Arc<Reflector>) -> Self {
        Self { reflector }
    }
}

#[tonic::async_trait]
impl ControlService for ControlServiceImpl {
    type PushCreateRequestsStream = CreateRequestStream;

    #[instrument(skip(self, request), fields(rpc = "OpenSession"))]
    async fn open_session(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<SessionInfo>, Status> {
        let session = self.reflector.open_session(request.remote_addr()).await;
        Ok(Response::new(SessionInfo {
            epoch: session.epoch,
        }))
    }

    #[instrument(skip(self, _request), fields(rpc = "CloseSession"))]
    async fn close_session(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.reflector.close_session().await;
        Ok(Response::new(Empty {}))
    }

    #[instrument(skip(self, _request), fields(rpc = "PushCreateRequests"))]
    async fn push_create_requests(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::PushCreateRequestsStream>, Status> {
        let (epoch, requests) = self.reflector.create_request_stream()?;
        info!(epoch, "Create-request stream opened");
        Ok(Response::new(Box::pin(requests.map(Ok::<_, Status>))))
    }

    #[instrument(skip(self, request), fields(rpc = "PushReports"))]
    async fn push_reports(
        &self,
        request: Request<Streaming<Report>>,
    ) -> Result<Response<Empty>, Status> {
        let epoch = self
            .reflector
            .current_session()
            .ok_or(ReflectorError::NoSession)?
            .epoch;
        let mut reports = request.into_inner();
        let mut sessions = self.reflector.watch_sessions();
        info!(epoch, "Report stream opened");

        let mut handled = 0u64;
        loop {
            let next = tokio::select! {
                () = session::superseded(&mut sessions, epoch) => {
                    info!(epoch, handled, "Session ended; closing report stream");
                    break;
                }
                next = reports.message() => next,
            };

            match next {
                Ok(Some(report)) => {
                    handled += 1;
                    let outcome = self.reflector.on_report(report).await;
                    debug!(id = report.id, port = report.port, ?outcome, "Report handled");
                }
                Ok(None) => {
                    info!(epoch, handled, "Report stream ended");
                    break;
                }
                Err(status) => {
                    if is_peer_disconnect(&status) {
                        info!(epoch, handled, "Worker disconnected from report stream");
                    } else {
                        warn!(epoch, error = %status, "Report stream failed");
                    }
                    self.reflector.on_control_stream_lost(epoch);
                    return Err(status);
                }
            }
        }

        Ok(Response::new(Empty {}))
    }
}
