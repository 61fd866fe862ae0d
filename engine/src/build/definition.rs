//! CI job definitions

use tracing::{debug, info};

use crate::adapters::build_server::BuildServer;
use crate::errors::ReleaseError;

/// Parameters every generated pipeline accepts
pub const PIPELINE_PARAMS: [&str; 5] = ["MODULE", "BRANCH", "IMAGE_TAG", "JOB_ID", "CALLBACK_URL"];

/// Pipeline job definition of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub description: String,
    /// Repository holding the pipeline scripts
    pub repo_url: String,
    pub credentials_id: String,
    /// Script path inside the repository
    pub script_path: String,
}

/// What `ensure_job_definition` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionChange {
    Created,
    Reconfigured,
    Unchanged,
}

impl JobDefinition {
    /// Pipeline-from-SCM job config
    pub fn render(&self) -> String {
        let params: String = PIPELINE_PARAMS
            .iter()
            .map(|name| {
                format!(
                    "        <hudson.model.StringParameterDefinition>\n          <name>{}</name>\n          <trim>true</trim>\n        </hudson.model.StringParameterDefinition>\n",
                    name
                )
            })
            .collect();

        format!(
            r#"<?xml version='1.1' encoding='UTF-8'?>
<flow-definition plugin="workflow-job">
  <description>{description}</description>
  <keepDependencies>false</keepDependencies>
  <properties>
    <hudson.model.ParametersDefinitionProperty>
      <parameterDefinitions>
{params}      </parameterDefinitions>
    </hudson.model.ParametersDefinitionProperty>
  </properties>
  <definition class="org.jenkinsci.plugins.workflow.cps.CpsScmFlowDefinition" plugin="workflow-cps">
    <scm class="hudson.plugins.git.GitSCM" plugin="git">
      <configVersion>2</configVersion>
      <userRemoteConfigs>
        <hudson.plugins.git.UserRemoteConfig>
          <url>{repo}</url>
          <credentialsId>{credentials}</credentialsId>
        </hudson.plugins.git.UserRemoteConfig>
      </userRemoteConfigs>
      <branches>
        <hudson.plugins.git.BranchSpec>
          <name>*/master</name>
        </hudson.plugins.git.BranchSpec>
      </branches>
    </scm>
    <scriptPath>{script}</scriptPath>
    <lightweight>true</lightweight>
  </definition>
  <disabled>false</disabled>
</flow-definition>
"#,
            description = xml_escape(&self.description),
            params = params,
            repo = xml_escape(&self.repo_url),
            credentials = xml_escape(&self.credentials_id),
            script = xml_escape(&self.script_path),
        )
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Create the job if absent, reconfigure it if its definition differs
pub async fn ensure_job_definition(
    server: &dyn BuildServer,
    name: &str,
    definition: &JobDefinition,
) -> Result<DefinitionChange, ReleaseError> {
    let config = definition.render();
    match server.job_config(name).await? {
        None => {
            server.create_job(name, &config).await?;
            info!("Created job definition {}", name);
            Ok(DefinitionChange::Created)
        }
        Some(existing) if existing.trim() == config.trim() => {
            debug!("Job definition {} is up to date", name);
            Ok(DefinitionChange::Unchanged)
        }
        Some(_) => {
            server.reconfig_job(name, &config).await?;
            info!("Reconfigured job definition {}", name);
            Ok(DefinitionChange::Reconfigured)
        }
    }
}
