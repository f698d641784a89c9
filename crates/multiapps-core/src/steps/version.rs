// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MTA version rule validation.

use async_trait::async_trait;
use semver::{BuildMetadata, Version};
use serde::{Deserialize, Serialize};

use crate::context::{ProcessContext, variables};
use crate::error::{CoreError, Result};
use crate::step::{Step, StepPhase};

/// Which versions may be deployed over an already deployed MTA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionRule {
    /// Only strictly higher versions.
    Higher,
    /// The same or a higher version.
    #[default]
    SameHigher,
    /// Any version.
    All,
}

impl VersionRule {
    /// Returns the string representation of the rule.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Higher => "HIGHER",
            Self::SameHigher => "SAME_HIGHER",
            Self::All => "ALL",
        }
    }

    /// Whether `new` may replace `deployed`. Build metadata is ignored.
    pub fn allows(&self, deployed: &Version, new: &Version) -> bool {
        let deployed = without_build(deployed);
        let new = without_build(new);
        match self {
            Self::Higher => new > deployed,
            Self::SameHigher => new >= deployed,
            Self::All => true,
        }
    }
}

fn without_build(version: &Version) -> Version {
    let mut version = version.clone();
    version.build = BuildMetadata::EMPTY;
    version
}

fn parse(version: &str) -> Result<Version> {
    Version::parse(version)
        .map_err(|e| CoreError::content(format!("Invalid MTA version \"{}\": {}", version, e)))
}

/// Check `new` against the `deployed` version under `rule`.
pub fn check_version(rule: VersionRule, deployed: &str, new: &str) -> Result<()> {
    if rule == VersionRule::All {
        return Ok(());
    }
    if rule.allows(&parse(deployed)?, &parse(new)?) {
        return Ok(());
    }
    Err(CoreError::content(format!(
        "Version rule \"{}\" does not allow deploying version \"{}\" over deployed version \"{}\"",
        rule.as_str(),
        new,
        deployed
    )))
}

/// Rejects a deployment whose version violates the process's version rule.
pub struct CheckVersionStep;

#[async_trait]
impl Step for CheckVersionStep {
    fn name(&self) -> &'static str {
        "checkVersion"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let new = ctx.require(variables::MTA_VERSION)?;
        let deployed = ctx
            .get(variables::DEPLOYED_MTA)?
            .and_then(|mta| mta.version);
        let Some(deployed) = deployed else {
            ctx.logger().info(format!("No deployed version, deploying {}", new));
            return Ok(StepPhase::Done);
        };

        let rule = ctx.require(variables::VERSION_RULE)?;
        ctx.logger().info(format!(
            "Deployed version {}, new version {}, rule {}",
            deployed,
            new,
            rule.as_str()
        ));
        check_version(rule, &deployed, &new)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error validating MTA version".to_string()
    }
}
