//! Executing routed calls.
//!
//! One2One forwards the request to the chosen backend and returns its reply.
//! One2Many runs every branch concurrently and merges the envelopes in
//! request order; a failing branch keeps its slot with the failure recorded
//! in its envelope metadata, and the fan-out never aborts early.

use crate::director::{Director, Mode};
use std::future::Future;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use uncloud_api::proto::Metadata;
use uncloud_api::{Envelope, Reply, PROXY_AUTHORITY_KEY};

/// Route `request` through the director and execute it with `call`, which
/// invokes one gRPC method on a backend channel and returns its reply.
pub async fn dispatch<R, Rep, F, Fut>(
    director: &Director,
    request: Request<R>,
    call: F,
) -> Result<Response<Rep>, Status>
where
    R: Clone + Send,
    Rep: Reply,
    F: Fn(Channel, Request<R>) -> Fut,
    Fut: Future<Output = Result<Rep, Status>> + Send,
{
    let routed = director.route(request.metadata())?;
    let message = request.into_inner();

    match routed.mode {
        Mode::One2One => {
            let backend = routed
                .backends
                .first()
                .ok_or_else(|| Status::internal("router returned no backend"))?;
            let reply =
                call(backend.channel(), branch_request(&message, routed.forward)).await?;

            let mut envelopes = reply.into_envelopes();
            if envelopes.is_empty() {
                envelopes.push(Rep::Envelope::default());
            }
            for envelope in &mut envelopes {
                envelope.set_metadata(Metadata::ok(backend.address()));
            }
            Ok(Response::new(Rep::from_envelopes(envelopes)))
        }
        Mode::One2Many => {
            let branches = routed.backends.iter().map(|backend| {
                let address = backend.address().to_string();
                let branch = call(backend.channel(), branch_request(&message, true));
                async move {
                    match branch.await {
                        Ok(reply) => {
                            let mut envelope =
                                reply.into_envelopes().into_iter().next().unwrap_or_default();
                            envelope.set_metadata(Metadata::ok(&address));
                            envelope
                        }
                        Err(status) => {
                            let mut envelope = Rep::Envelope::default();
                            envelope.set_metadata(Metadata::failed(&address, &status));
                            envelope
                        }
                    }
                }
            });
            let envelopes = futures_util::future::join_all(branches).await;
            Ok(Response::new(Rep::from_envelopes(envelopes)))
        }
    }
}

/// A request for one backend branch. Forwarded branches carry the
/// `proxy-authority` marker so the receiving proxy terminates them locally.
fn branch_request<R: Clone>(message: &R, forward: bool) -> Request<R> {
    let mut request = Request::new(message.clone());
    if forward {
        request
            .metadata_mut()
            .insert(PROXY_AUTHORITY_KEY, MetadataValue::from_static("proxy"));
    }
    request
}
