use std::thread;

use http::Method;
use tracing::debug;

use super::HttpClient;
use crate::execution::{Start, Step};
use crate::request::RequestOptions;
use crate::response::HttpResponse;

impl HttpClient {
    /// Runs one logical request: cache, breaker, plugins and the retry loop.
    pub fn execute(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<HttpResponse> {
        let mut run = match self.core.start(method, url, options) {
            Start::Finished(result) => return result,
            Start::Run(run) => run,
        };

        loop {
            let result = {
                let _entered = run.span().enter();
                debug!(attempt = run.attempt(), "sending request");
                self.transport.send(run.request())
            };
            match self.core.complete_attempt(&mut run, result) {
                Step::Retry(delay) => {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Step::Finished(result) => return result,
            }
        }
    }
}
