//! Envelope boundary for application API services

use crate::client::ApiClient;
use crate::envelope::ApiResponse;
use crate::error::ApiError;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Base for application API services built on an [`ApiClient`]
///
/// Implementors only supply the client; [`execute_request`](Self::execute_request)
/// turns every outcome of an operation into an [`ApiResponse`].
///
/// ```ignore
/// struct UserApi { client: ApiClient }
///
/// impl BaseApiService for UserApi {
///     fn api_client(&self) -> &ApiClient { &self.client }
/// }
///
/// impl UserApi {
///     async fn list(&self) -> ApiResponse<Vec<User>> {
///         self.execute_request(|c| async move { c.get("/users").send_json().await })
///             .await
///     }
/// }
/// ```
#[async_trait]
pub trait BaseApiService: Send + Sync {
    fn api_client(&self) -> &ApiClient;

    /// Run `operation` with a handle to the client and wrap the outcome
    async fn execute_request<T, F, Fut>(&self, operation: F) -> ApiResponse<T>
    where
        T: Send,
        F: FnOnce(ApiClient) -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
    {
        let client = self.api_client().clone();
        execute_request(async move { operation(client).await }).await
    }
}

/// Await `operation` and convert its outcome into an envelope
///
/// Taxonomy errors map through [`ApiResponse::from_error`]. A panic inside
/// the operation is caught and reported as an `Unknown` error.
pub async fn execute_request<T, Fut>(operation: Fut) -> ApiResponse<T>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    match AssertUnwindSafe(operation).catch_unwind().await {
        Ok(Ok(data)) => ApiResponse::success(data),
        Ok(Err(err)) => {
            tracing::debug!(kind = %err.kind(), status = ?err.status_code(), "request failed");
            ApiResponse::from_error(&err)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "request operation panicked");
            ApiResponse::from_error(&ApiError::unknown(format!("Unexpected error: {message}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, RetryConfig};
    use crate::connectivity::AssumeOnline;
    use crate::error::ErrorKind;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    struct UserApi {
        client: ApiClient,
    }

    impl BaseApiService for UserApi {
        fn api_client(&self) -> &ApiClient {
            &self.client
        }
    }

    impl UserApi {
        async fn user(&self, id: u32) -> ApiResponse<serde_json::Value> {
            self.execute_request(move |client| async move {
                client.get(&format!("/users/{id}")).send_json().await
            })
            .await
        }
    }

    fn user_api(server: &MockServer) -> UserApi {
        let mut config = NetworkConfig::new(server.base_url());
        config.retry = RetryConfig::disabled();
        let client = ApiClient::builder(config)
            .connectivity(Arc::new(AssumeOnline))
            .build()
            .unwrap();
        UserApi { client }
    }

    #[tokio::test]
    async fn test_success_is_wrapped() {
        let resp = execute_request(async { Ok::<_, ApiError>(5) }).await;
        assert!(resp.is_success());
        assert_eq!(resp.into_data(), Some(5));
    }

    #[tokio::test]
    async fn test_error_is_mapped() {
        let resp: ApiResponse<()> = execute_request(async { Err(ApiError::cancelled()) }).await;
        assert!(resp.is_error());
        assert_eq!(resp.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_panic_becomes_unknown_error() {
        let resp: ApiResponse<u8> = execute_request(async {
            if true {
                panic!("boom");
            }
            Ok(1)
        })
        .await;

        assert!(resp.is_error());
        assert_eq!(resp.error_kind(), Some(ErrorKind::Unknown));
        assert_eq!(resp.message(), Some("Unexpected error: boom"));
    }

    #[tokio::test]
    async fn test_service_wraps_client_calls() {
        let server = MockServer::start();
        let _found = server.mock(|when, then| {
            when.method(GET).path("/users/1");
            then.status(200).json_body(json!({"id": 1, "name": "Ada"}));
        });
        let missing = server.mock(|when, then| {
            when.method(GET).path("/users/999");
            then.status(404);
        });

        let api = user_api(&server);

        let found = api.user(1).await;
        assert!(found.is_success());
        assert_eq!(found.data().unwrap()["name"], "Ada");

        let not_found = api.user(999).await;
        assert!(!not_found.is_success());
        assert_eq!(not_found.error_kind(), Some(ErrorKind::Client));
        assert_eq!(not_found.status_code(), Some(404));
        assert_eq!(missing.calls(), 1);
    }
}
