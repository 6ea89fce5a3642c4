use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod build;
pub mod ccache;
pub mod core;
pub mod kernel;
pub mod package;
pub mod patch;
pub mod publish;
pub mod toolchain;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(kernel::KernelModule),
        Box::new(toolchain::ToolchainModule),
        Box::new(patch::PatchModule),
        Box::new(ccache::CcacheModule),
        Box::new(build::BuildModule),
        Box::new(package::PackageModule),
        Box::new(publish::PublishModule),
    ]
}

/// Let every detected module add its tasks, then add the plan barriers.
pub fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            tracing::debug!(module = m.id(), "planning module");
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}
