use super::{Probe, ProbeContext, ProbeError, ProbeKind};
use crate::config::{EnvFlag, HttpMethod, HttpProbeConfig};
use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

/// HTTP probe checking status code and response shape.
pub struct HttpProbe {
    client: Client,
    url: String,
    timeout: Duration,
    spec: HttpProbeConfig,
}

impl HttpProbe {
    pub fn new(spec: &HttpProbeConfig, ctx: &ProbeContext) -> Result<Self> {
        let timeout = Duration::from_millis(spec.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: ctx.url(&spec.path),
            timeout,
            spec: spec.clone(),
        })
    }

    fn check_status(&self, status: u16) -> Result<(), ProbeError> {
        let ok = match self.spec.expect_status {
            Some(expected) => status == expected,
            None => (200..300).contains(&status),
        };
        if ok {
            return Ok(());
        }
        Err(ProbeError::UnexpectedStatus {
            expected: self
                .spec
                .expect_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "2xx".to_string()),
            actual: status,
        })
    }

    fn check_body(&self, body: &str) -> Result<(), ProbeError> {
        if let Some(needle) = &self.spec.expect_body_contains {
            if !body.contains(needle.as_str()) {
                return Err(ProbeError::Body(format!("missing \"{needle}\"")));
            }
        }

        if self.spec.expect_json_keys.is_empty() {
            return Ok(());
        }

        let json: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProbeError::Body(format!("expected JSON: {e}")))?;
        let object = json
            .as_object()
            .ok_or_else(|| ProbeError::Body("expected a JSON object".to_string()))?;
        let missing: Vec<&str> = self
            .spec
            .expect_json_keys
            .iter()
            .filter(|k| !object.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProbeError::Body(format!("missing key(s) {}", missing.join(", "))))
        }
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Http
    }

    fn flag(&self) -> Option<EnvFlag> {
        self.spec.flag
    }

    async fn check(&self) -> Result<String, ProbeError> {
        let request = match self.spec.method {
            HttpMethod::Get => self.client.get(&self.url),
            HttpMethod::Post => {
                let req = self.client.post(&self.url);
                match &self.spec.body {
                    Some(body) => req.json(body),
                    None => req,
                }
            }
        };

        // The client timeout covers connect and body; the outer bound also
        // catches a server that stalls mid-stream.
        let exchange = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => return Err(ProbeError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(ProbeError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(ProbeError::Request(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        self.check_status(status)?;
        self.check_body(&body)?;

        Ok(format!("{} {} -> {}", method_label(self.spec.method), self.url, status))
    }
}

fn method_label(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Get => "GET",
        HttpMethod::Post => "POST",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(spec: HttpProbeConfig) -> HttpProbe {
        let ctx = ProbeContext {
            base_url: "http://localhost:3000".into(),
            workdir: ".".into(),
        };
        HttpProbe::new(&spec, &ctx).unwrap()
    }

    #[test]
    fn test_status_defaults_to_any_2xx() {
        let p = probe(HttpProbeConfig::default());
        assert!(p.check_status(200).is_ok());
        assert!(p.check_status(204).is_ok());
        let err = p.check_status(500).unwrap_err();
        assert_eq!(err.to_string(), "expected status 2xx, got 500");
    }

    #[test]
    fn test_exact_status() {
        let p = probe(HttpProbeConfig {
            expect_status: Some(401),
            ..HttpProbeConfig::default()
        });
        assert!(p.check_status(401).is_ok());
        assert!(p.check_status(200).is_err());
    }

    #[test]
    fn test_body_json_keys() {
        let p = probe(HttpProbeConfig {
            expect_json_keys: vec!["status".into(), "uptime".into()],
            ..HttpProbeConfig::default()
        });
        assert!(p.check_body(r#"{"status":"ok","uptime":12}"#).is_ok());
        assert_eq!(
            p.check_body(r#"{"status":"ok"}"#).unwrap_err().to_string(),
            "unexpected response body: missing key(s) uptime"
        );
        assert!(p.check_body("<html>").is_err());
        assert!(p.check_body("[1,2]").is_err());
    }

    #[test]
    fn test_body_substring() {
        let p = probe(HttpProbeConfig {
            expect_body_contains: Some("<html".into()),
            ..HttpProbeConfig::default()
        });
        assert!(p.check_body("<!DOCTYPE html><html lang=\"en\">").is_ok());
        assert!(p.check_body("Internal Server Error").is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_is_failure() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let ctx = ProbeContext {
            base_url: format!("http://127.0.0.1:{port}"),
            workdir: ".".into(),
        };
        let p = HttpProbe::new(
            &HttpProbeConfig {
                name: "Health Endpoint".into(),
                timeout_ms: 2_000,
                ..HttpProbeConfig::default()
            },
            &ctx,
        )
        .unwrap();

        assert!(matches!(p.check().await, Err(ProbeError::Request(_))));
    }
}
