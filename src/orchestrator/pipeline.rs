//! Step ids and their order per run kind.

#[cfg(test)]
use runway_common::RunKind;

pub const RUN_START: &str = "run.start";
pub const RUN_COMPLETE: &str = "run.complete";
pub const ARTIFACT_RUN_SUMMARY: &str = "artifact.run_summary";

pub const IMPL_PREFLIGHT: &str = "impl.preflight";
pub const IMPL_REPO_ENSURE: &str = "impl.repo.ensure";
pub const IMPL_SANDBOX_CHECKOUT: &str = "impl.sandbox.checkout";
pub const IMPL_PLAN: &str = "impl.plan";
pub const IMPL_PATCH: &str = "impl.patch";
pub const IMPL_VERIFY: &str = "impl.verify";
pub const IMPL_PR_OPEN: &str = "impl.pr.open";
pub const IMPL_SANDBOX_STOP: &str = "impl.sandbox.stop";
pub const APPROVAL_MERGE: &str = "approval.merge";
pub const REPO_CHECKS: &str = "repo.checks";
pub const REPO_MERGE: &str = "repo.merge";
pub const APPROVAL_PROVISION: &str = "approval.provision";
pub const INFRA_PROVISION: &str = "infra.provision";
pub const APPROVAL_DEPLOY_PROD: &str = "approval.deploy_prod";
pub const DEPLOY_PRODUCTION: &str = "deploy.production";

pub const SCOPE_MERGE: &str = "merge";
pub const SCOPE_PROVISION: &str = "provision";
pub const SCOPE_DEPLOY_PROD: &str = "deploy_prod";

#[cfg(test)]
const RESEARCH: &[&str] = &[RUN_START, RUN_COMPLETE, ARTIFACT_RUN_SUMMARY];

#[cfg(test)]
const IMPLEMENTATION: &[&str] = &[
    IMPL_PREFLIGHT,
    IMPL_REPO_ENSURE,
    IMPL_SANDBOX_CHECKOUT,
    IMPL_PLAN,
    IMPL_PATCH,
    IMPL_VERIFY,
    IMPL_PR_OPEN,
    IMPL_SANDBOX_STOP,
    APPROVAL_MERGE,
    REPO_CHECKS,
    REPO_MERGE,
    APPROVAL_PROVISION,
    INFRA_PROVISION,
    APPROVAL_DEPLOY_PROD,
    DEPLOY_PRODUCTION,
    RUN_COMPLETE,
    ARTIFACT_RUN_SUMMARY,
];

/// Every step a successful run of `kind` goes through, in order. The
/// pipeline bodies in `steps` are checked against this by the scenario tests.
#[cfg(test)]
pub fn pipeline_steps(kind: RunKind) -> &'static [&'static str] {
    match kind {
        RunKind::Research => RESEARCH,
        RunKind::Implementation => IMPLEMENTATION,
    }
}
