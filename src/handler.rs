use futures::future::BoxFuture;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// The user-supplied request handler, invoked exactly once per fully
/// received request.
///
/// The handler may read the body through `request.stdin()`, mutate the
/// response (status, headers and cookies until the header block is sent;
/// body bytes after), and optionally close the response. When it returns,
/// the dispatcher flushes unsent headers and closes the output if the
/// handler left it open.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, response: Response) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, request: Request, response: Response) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(request, response))
    }
}
