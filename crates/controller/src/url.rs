//! Job URL rendering
//!
//! Operators configure a template with `{placeholder}` markers; the
//! controller substitutes run metadata and status into it on every
//! transition out of Triggered.

use hodei_run_crd::JobRun;
use kube::ResourceExt;

/// Render the job URL for a run. An empty template renders to the empty
/// string, which leaves the status URL untouched.
pub fn render_job_url(template: &str, run: &JobRun) -> String {
    if template.is_empty() {
        return String::new();
    }
    let status = run.status.as_ref();
    template
        .replace("{name}", &run.name_any())
        .replace("{job}", &run.spec.job)
        .replace("{type}", &run.spec.job_type.to_string())
        .replace("{state}", &run.state().to_string())
        .replace(
            "{build_id}",
            status.map(|s| s.build_id.as_str()).unwrap_or(""),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::triggered_run;
    use hodei_run_crd::JobRunState;

    #[test]
    fn test_render_substitutes_placeholders() {
        let mut run = triggered_run("blabla", "boop");
        run.status_mut().state = JobRunState::Pending;
        run.status_mut().build_id = "0987654321".to_string();
        assert_eq!(
            render_job_url("{name}/{state}", &run),
            "blabla/pending".to_string()
        );
        assert_eq!(
            render_job_url("https://ci/{job}/{build_id}", &run),
            "https://ci/boop/0987654321".to_string()
        );
    }

    #[test]
    fn test_empty_template_renders_empty() {
        let run = triggered_run("blabla", "boop");
        assert_eq!(render_job_url("", &run), "");
    }
}
