//! Pipeline definition and vars file rendered per application.

use std::collections::BTreeMap;

use cairn_core::{Error, Result};
use minijinja::{context, Environment, UndefinedBehavior};

const PIPELINE_TEMPLATE: &str = include_str!("../../assets/concourse/pipeline.yml.j2");

/// `argo-cd.server` -> `ARGO_CD_SERVER`
pub fn env_name(key: &str) -> String {
    key.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }).collect()
}

/// Render the pipeline for the given var and secret key names.
pub fn render_pipeline(vars: &[String], secrets: &[String]) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("env_name", |key: &str| env_name(key));
    env.add_template("pipeline", PIPELINE_TEMPLATE).map_err(|e| Error::Template(e.to_string()))?;
    let tmpl = env.get_template("pipeline").map_err(|e| Error::Template(e.to_string()))?;
    tmpl.render(context! { vars => vars, secrets => secrets }).map_err(|e| Error::Template(e.to_string()))
}

/// `application-vars: {key: value}` for `--load-vars-from`.
pub fn render_vars_file(vars: &BTreeMap<String, String>) -> Result<String> {
    let mut doc = BTreeMap::new();
    doc.insert(cairn_inputs::APPLICATION_VARS, vars);
    serde_yaml::to_string(&doc).map_err(|e| Error::Template(format!("vars file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_are_shell_safe() {
        assert_eq!(env_name("argo-cd.server"), "ARGO_CD_SERVER");
        assert_eq!(env_name("minio.accessKey"), "MINIO_ACCESSKEY");
    }

    #[test]
    fn pipeline_references_each_key() {
        let out = render_pipeline(&["argo-cd.server".into()], &["argo-cd.password".into()]).unwrap();
        assert!(out.contains("ARGO_CD_SERVER: ((application-vars.\"argo-cd.server\"))"), "{}", out);
        assert!(out.contains("ARGO_CD_PASSWORD: ((application-secrets.\"argo-cd.password\"))"), "{}", out);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert!(parsed.get("jobs").is_some());
    }

    #[test]
    fn pipeline_without_inputs_is_valid_yaml() {
        let out = render_pipeline(&[], &[]).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert!(parsed.get("jobs").is_some());
    }

    #[test]
    fn vars_file_nests_under_application_vars() {
        let mut vars = BTreeMap::new();
        vars.insert("argo-cd.server".to_string(), "argo-cd-argocd-server".to_string());
        let out = render_vars_file(&vars).unwrap();
        let parsed: BTreeMap<String, BTreeMap<String, String>> = serde_yaml::from_str(&out).unwrap();
        assert_eq!(parsed["application-vars"]["argo-cd.server"], "argo-cd-argocd-server");
    }
}
