//! HTTP API tests: start the student's server inside the sandbox, wait for
//! readiness on the mapped host port, then probe it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::models::TestResult;
use crate::sandbox::{RunOptions, SandboxLease};

use super::params::Params;
use super::{Template, TestFn, TestFuture, TestInvocation};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the `api` template.
pub fn template() -> Template {
    Template::new("api", true)
        .register("expect_status", Arc::new(ExpectStatus))
        .register("expect_json", Arc::new(ExpectJson))
}

/// Resolves the base URL of the student server, starting it if nothing is
/// listening yet. Returns a ready-to-use `http://host:port` prefix.
async fn ensure_server(
    inv: &TestInvocation<'_>,
    sandbox: &SandboxLease,
    params: &Params<'_>,
) -> Result<String, TestResult> {
    let container_port = match params.opt_u64("container_port") {
        Ok(Some(port)) => port as u16,
        Ok(None) => {
            // Fall back to the pool's configured forwarding.
            match sandbox.mapped_port_any() {
                Some(port) => port,
                None => {
                    return Err(TestResult::error(
                        "No container port is mapped for this sandbox",
                    ))
                }
            }
        }
        Err(e) => return Err(e.into_result()),
    };

    let (host, port) = match sandbox.mapped_port(container_port) {
        Ok(mapping) => mapping,
        Err(e) => return Err(TestResult::error(format!("Port mapping unavailable: {e}"))),
    };
    let base = format!("http://{host}:{port}");

    if server_responds(inv, &base).await {
        return Ok(base);
    }

    // Nothing listening yet: start the server in the background.
    let command = match params.str("program_command") {
        Ok(cmd) => cmd.to_string(),
        Err(e) => return Err(e.into_result()),
    };
    if let Err(e) = sandbox
        .run(&command, &RunOptions::default().detached())
        .await
    {
        return Err(TestResult::error(format!(
            "Could not start the server: {e}"
        )));
    }

    let start = tokio::time::Instant::now();
    while start.elapsed() < READY_TIMEOUT {
        if server_responds(inv, &base).await {
            return Ok(base);
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }

    // Environmental fault, not a wrong answer: the test scores 0 with an
    // explanatory report and grading continues.
    Err(TestResult::error(format!(
        "Server did not start listening on port {container_port} within {}s",
        READY_TIMEOUT.as_secs()
    )))
}

/// Any HTTP response at all counts as readiness, error statuses included.
async fn server_responds(inv: &TestInvocation<'_>, base: &str) -> bool {
    inv.services
        .http
        .get(base)
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .is_ok()
}

async fn probe(
    inv: &TestInvocation<'_>,
    base: &str,
    method: &str,
    path: &str,
) -> Result<reqwest::Response, TestResult> {
    let url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    let method = match method.to_ascii_uppercase().parse::<reqwest::Method>() {
        Ok(m) => m,
        Err(_) => {
            return Err(TestResult::error(format!("Unsupported HTTP method '{method}'")));
        }
    };

    // A connection failure or timeout here is an infrastructure fault;
    // assertions on the response decide pass/fail.
    inv.services
        .http
        .request(method, &url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| TestResult::error(format!("Request to {url} failed: {e}")))
}

/// `expect_status(method?, path, status, program_command)`.
struct ExpectStatus;

impl TestFn for ExpectStatus {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path", "status", "program_command"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let path = match params.str("path") {
                Ok(p) => p.to_string(),
                Err(e) => return e.into_result(),
            };
            let expected = match params.u64("status") {
                Ok(s) => s as u16,
                Err(e) => return e.into_result(),
            };
            let method = match params.opt_str("method") {
                Ok(m) => m.unwrap_or("GET").to_string(),
                Err(e) => return e.into_result(),
            };

            let Some(sandbox) = inv.sandbox else {
                return TestResult::error("expect_status requires a sandbox environment");
            };

            let base = match ensure_server(&inv, sandbox, &params).await {
                Ok(base) => base,
                Err(result) => return result,
            };

            let response = match probe(&inv, &base, &method, &path).await {
                Ok(response) => response,
                Err(result) => return result,
            };

            let got = response.status().as_u16();
            if got == expected {
                TestResult::pass(format!("{method} {path} returned {got}"))
            } else {
                TestResult::fail(format!(
                    "{method} {path} returned {got}, expected {expected}"
                ))
            }
        })
    }
}

/// `expect_json(method?, path, expected, program_command)`.
///
/// The response body must be JSON and contain `expected` as a subset:
/// every key in expected objects must be present and match, arrays must
/// match elementwise, scalars must be equal.
struct ExpectJson;

impl TestFn for ExpectJson {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path", "expected", "program_command"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let path = match params.str("path") {
                Ok(p) => p.to_string(),
                Err(e) => return e.into_result(),
            };
            let expected = match params.value("expected") {
                Ok(v) => v.clone(),
                Err(e) => return e.into_result(),
            };
            let method = match params.opt_str("method") {
                Ok(m) => m.unwrap_or("GET").to_string(),
                Err(e) => return e.into_result(),
            };

            let Some(sandbox) = inv.sandbox else {
                return TestResult::error("expect_json requires a sandbox environment");
            };

            let base = match ensure_server(&inv, sandbox, &params).await {
                Ok(base) => base,
                Err(result) => return result,
            };

            let response = match probe(&inv, &base, &method, &path).await {
                Ok(response) => response,
                Err(result) => return result,
            };

            let status = response.status();
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    return TestResult::fail(format!(
                        "{method} {path} ({status}) did not return valid JSON: {e}"
                    ));
                }
            };

            match json_subset(&expected, &body) {
                None => TestResult::pass(format!("{method} {path} returned the expected JSON")),
                Some(mismatch) => TestResult::fail(format!(
                    "{method} {path} JSON mismatch at {mismatch}.\nExpected subset:\n{expected}\nActual:\n{body}"
                )),
            }
        })
    }
}

/// Checks that `expected` is structurally contained in `actual`. Returns the
/// JSON-pointer-ish path of the first mismatch, or `None` on success.
fn json_subset(expected: &Value, actual: &Value) -> Option<String> {
    fn walk(expected: &Value, actual: &Value, path: &str) -> Option<String> {
        match (expected, actual) {
            (Value::Object(exp), Value::Object(act)) => {
                for (key, value) in exp {
                    let child = format!("{path}/{key}");
                    match act.get(key) {
                        Some(actual_value) => {
                            if let Some(mismatch) = walk(value, actual_value, &child) {
                                return Some(mismatch);
                            }
                        }
                        None => return Some(child),
                    }
                }
                None
            }
            (Value::Array(exp), Value::Array(act)) => {
                if exp.len() != act.len() {
                    return Some(format!("{path} (length {} != {})", exp.len(), act.len()));
                }
                for (i, (e, a)) in exp.iter().zip(act.iter()).enumerate() {
                    if let Some(mismatch) = walk(e, a, &format!("{path}/{i}")) {
                        return Some(mismatch);
                    }
                }
                None
            }
            (Value::Number(e), Value::Number(a)) => {
                let close = match (e.as_f64(), a.as_f64()) {
                    (Some(e), Some(a)) => (e - a).abs() < 1e-9,
                    _ => e == a,
                };
                if close {
                    None
                } else {
                    Some(path.to_string())
                }
            }
            (e, a) => {
                if e == a {
                    None
                } else {
                    Some(path.to_string())
                }
            }
        }
    }

    walk(expected, actual, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParameterConfig, TestStatus};
    use crate::sandbox::{FakeBackend, LanguagePoolConfig, PoolConfig, SandboxPool};
    use crate::templates::TestServices;
    use indexmap::IndexMap;
    use serde_json::json;
    use wiremock::matchers::{method as http_method, path as http_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A lease whose mapped port points at the given local server port.
    async fn lease_for(port: u16) -> (SandboxPool, crate::sandbox::SandboxLease) {
        let backend = Arc::new(FakeBackend::new().with_static_host_port(port));
        let pool = SandboxPool::new(
            PoolConfig::single(
                "node",
                LanguagePoolConfig::new("node:20-slim", 1).with_container_port(3000),
            ),
            backend,
        );
        pool.initialize().await.unwrap();
        let lease = pool.acquire("node", Duration::from_secs(1)).await.unwrap();
        (pool, lease)
    }

    #[tokio::test]
    async fn expect_status_probes_the_mapped_port() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(http_path("/health"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        // Root responds too, so readiness detection succeeds immediately.
        Mock::given(http_method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let port = server.address().port();
        let (pool, lease) = lease_for(port).await;

        let parameters = vec![
            ParameterConfig::new("path", json!("/health")),
            ParameterConfig::new("status", json!(204)),
            ParameterConfig::new("program_command", json!("node server.js")),
        ];
        let files = IndexMap::new();
        let services = TestServices::new();

        let result = ExpectStatus
            .run(TestInvocation {
                parameters: &parameters,
                file: None,
                files: &files,
                sandbox: Some(&lease),
                services: &services,
            })
            .await;

        assert_eq!(result.status, TestStatus::Pass);

        let wrong = vec![
            ParameterConfig::new("path", json!("/health")),
            ParameterConfig::new("status", json!(200)),
            ParameterConfig::new("program_command", json!("node server.js")),
        ];
        let result = ExpectStatus
            .run(TestInvocation {
                parameters: &wrong,
                file: None,
                files: &files,
                sandbox: Some(&lease),
                services: &services,
            })
            .await;
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.report.contains("204"));

        lease.release().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn expect_json_asserts_a_body_subset() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(http_path("/api/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "ada", "id": 1, "roles": ["student"]
            })))
            .mount(&server)
            .await;
        Mock::given(http_method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let port = server.address().port();
        let (pool, lease) = lease_for(port).await;

        let parameters = vec![
            ParameterConfig::new("path", json!("/api/user")),
            ParameterConfig::new("expected", json!({"name": "ada"})),
            ParameterConfig::new("program_command", json!("node server.js")),
        ];
        let files = IndexMap::new();
        let services = TestServices::new();

        let result = ExpectJson
            .run(TestInvocation {
                parameters: &parameters,
                file: None,
                files: &files,
                sandbox: Some(&lease),
                services: &services,
            })
            .await;
        assert_eq!(result.status, TestStatus::Pass);

        let mismatched = vec![
            ParameterConfig::new("path", json!("/api/user")),
            ParameterConfig::new("expected", json!({"name": "grace"})),
            ParameterConfig::new("program_command", json!("node server.js")),
        ];
        let result = ExpectJson
            .run(TestInvocation {
                parameters: &mismatched,
                file: None,
                files: &files,
                sandbox: Some(&lease),
                services: &services,
            })
            .await;
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.report.contains("/name"));

        lease.release().await;
        pool.shutdown().await;
    }

    /// A local port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn failed_probe_is_an_infrastructure_error() {
        let base = format!("http://127.0.0.1:{}", closed_port());
        let files = IndexMap::new();
        let services = TestServices::new();
        let inv = TestInvocation {
            parameters: &[],
            file: None,
            files: &files,
            sandbox: None,
            services: &services,
        };

        let result = probe(&inv, &base, "GET", "/health").await.unwrap_err();
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.score, 0.0);
        assert!(result.report.contains("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_server_is_an_infrastructure_error() {
        // Connections are refused immediately, so the readiness loop spends
        // its whole window; paused time fast-forwards the poll sleeps.
        let (pool, lease) = lease_for(closed_port()).await;

        let parameters = vec![
            ParameterConfig::new("path", json!("/health")),
            ParameterConfig::new("status", json!(200)),
            ParameterConfig::new("program_command", json!("node server.js")),
        ];
        let files = IndexMap::new();
        let services = TestServices::new();

        let result = ExpectStatus
            .run(TestInvocation {
                parameters: &parameters,
                file: None,
                files: &files,
                sandbox: Some(&lease),
                services: &services,
            })
            .await;

        assert_eq!(result.status, TestStatus::Error);
        assert!(result.report.contains("did not start listening"));

        lease.release().await;
        pool.shutdown().await;
    }

    #[test]
    fn json_subset_accepts_extra_keys() {
        let expected = json!({"name": "ada", "score": 10});
        let actual = json!({"name": "ada", "score": 10, "id": 7});
        assert_eq!(json_subset(&expected, &actual), None);
    }

    #[test]
    fn json_subset_reports_the_mismatch_path() {
        let expected = json!({"user": {"name": "ada"}});
        let actual = json!({"user": {"name": "grace"}});
        assert_eq!(
            json_subset(&expected, &actual),
            Some("/user/name".to_string())
        );

        let missing = json!({"user": {"email": "x"}});
        assert_eq!(
            json_subset(&missing, &actual),
            Some("/user/email".to_string())
        );
    }

    #[test]
    fn json_subset_arrays_match_elementwise() {
        let expected = json!([1, 2, 3]);
        assert_eq!(json_subset(&expected, &json!([1, 2, 3])), None);
        assert!(json_subset(&expected, &json!([1, 2])).is_some());
        assert!(json_subset(&expected, &json!([1, 2, 4])).is_some());
    }

    #[test]
    fn json_subset_numbers_compare_numerically() {
        assert_eq!(json_subset(&json!(1.0), &json!(1)), None);
        assert!(json_subset(&json!(1.5), &json!(1)).is_some());
    }
}
