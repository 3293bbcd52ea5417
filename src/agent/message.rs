//! Diagnostic text attached to coordinator notifications.

use super::Agent;
use crate::registry::{Job, ServiceRecord};

/// Upper bound on a notification message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1500;

impl Agent {
    /// The run's error text followed by every service's and instance's
    /// error text, truncated to [`MAX_MESSAGE_CHARS`].
    pub async fn build_error_message(&self, job: &Job) -> String {
        let services = self.services.list().await;
        compose_error_message(&job.error(), &services)
    }
}

pub fn compose_error_message(run_error: &str, services: &[ServiceRecord]) -> String {
    let mut msg = String::new();
    if !run_error.is_empty() {
        msg.push_str("job error message:\n");
        push_line(&mut msg, run_error);
    }

    let mut sections = String::new();
    for svc in services {
        if svc.has_error() {
            sections.push_str(&format!("svc {} error message\n", svc.name));
            if let Some(err) = &svc.discovery_error {
                push_line(&mut sections, err);
            }
            if !svc.error.is_empty() {
                push_line(&mut sections, &svc.error);
            }
        }
        let mut instance_errors = svc.instances.iter().filter_map(|i| i.error()).peekable();
        if instance_errors.peek().is_some() {
            sections.push_str(&format!("svc {} pod error message\n", svc.name));
            for err in instance_errors {
                push_line(&mut sections, err);
            }
        }
    }
    if !sections.is_empty() {
        msg.push_str(&sections);
        msg.push('\n');
    }

    truncate(msg, MAX_MESSAGE_CHARS)
}

fn push_line(buf: &mut String, text: &str) {
    buf.push_str(text);
    if !text.ends_with('\n') {
        buf.push('\n');
    }
}

fn truncate(msg: String, max_chars: usize) -> String {
    match msg.char_indices().nth(max_chars) {
        Some((cut, _)) => msg[..cut].to_string(),
        None => msg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Instance, InstanceHealth};
    use crate::topology::InstanceSpec;

    fn service(name: &str, error: &str, instance_errors: &[&str]) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            image: "img".to_string(),
            archives: Vec::new(),
            instances: instance_errors
                .iter()
                .enumerate()
                .map(|(i, e)| Instance {
                    spec: InstanceSpec {
                        address: format!("10.0.0.{i}"),
                        name: format!("{name}-{i}"),
                        container: name.to_string(),
                    },
                    health: if e.is_empty() {
                        InstanceHealth::Healthy
                    } else {
                        InstanceHealth::Errored(e.to_string())
                    },
                })
                .collect(),
            discovery_error: None,
            error: error.to_string(),
            deleted: false,
        }
    }

    #[test]
    fn test_empty_when_nothing_failed() {
        assert_eq!(compose_error_message("", &[service("a", "", &["", ""])]), "");
    }

    #[test]
    fn test_sections_are_labelled_by_service() {
        let services = vec![
            service("orders", "merge failed", &["", "dial timeout"]),
            service("users", "", &["dump failed"]),
        ];

        let msg = compose_error_message("no archives", &services);

        assert_eq!(
            msg,
            "job error message:\nno archives\n\
             svc orders error message\nmerge failed\n\
             svc orders pod error message\ndial timeout\n\
             svc users pod error message\ndump failed\n\n"
        );
    }

    #[test]
    fn test_discovery_error_precedes_run_errors() {
        let mut svc = service("orders", "merge failed", &[]);
        svc.discovery_error = Some("load svc orders jar error: no archives".into());

        let msg = compose_error_message("", &[svc]);

        assert_eq!(
            msg,
            "svc orders error message\n\
             load svc orders jar error: no archives\nmerge failed\n\n"
        );
    }

    #[test]
    fn test_truncates_to_exact_limit() {
        let long = "x".repeat(4000);
        let msg = compose_error_message(&long, &[]);
        assert_eq!(msg.chars().count(), MAX_MESSAGE_CHARS);

        let short = compose_error_message("short", &[]);
        assert!(short.chars().count() < MAX_MESSAGE_CHARS);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let wide = "é".repeat(2000);
        let msg = compose_error_message(&wide, &[]);
        assert_eq!(msg.chars().count(), MAX_MESSAGE_CHARS);
    }
}
