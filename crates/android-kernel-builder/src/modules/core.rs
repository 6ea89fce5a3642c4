use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};

/// Top-level tables a build definition may contain.
pub const KNOWN_TABLES: &[&str] = &[
    "workspace",
    "kernel",
    "toolchain",
    "build",
    "patch",
    "ccache",
    "package",
    "publish",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.top_level_keys() {
            if !KNOWN_TABLES.contains(&key) {
                return Err(Error::config(format!(
                    "unknown config table '{}'; expected one of: {}",
                    key,
                    KNOWN_TABLES.join(", ")
                )));
            }
        }
        for required in ["kernel", "build"] {
            if !doc.has_table_path(required) {
                return Err(Error::config(format!(
                    "build definition {} has no [{}] table",
                    doc.path.display(),
                    required
                )));
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
            best_effort: false,
        })?;
        Ok(())
    }
}
