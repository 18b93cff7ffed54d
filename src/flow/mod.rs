//! The SP-initiated login flow, independent of the proxy protocol.

mod context;
mod orchestrator;
mod redirect;
mod request;

pub use context::{
    AuthenticationContext, ContextPropagator, PREFERRED_LANGUAGE_COOKIE, REDIRECT_COOKIE,
    REDIRECT_PARAM,
};
pub use orchestrator::{FlowOrchestrator, Leg};
pub use redirect::RedirectGuard;
pub use request::{FlowResponse, SamlRequest, SetCookie};
