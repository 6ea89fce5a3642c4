use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// Id of the synthetic task that waits for every feature patch.
pub const PATCH_BARRIER_ID: &str = "core.barrier.patch";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` marks the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
    pub best_effort: bool,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::config(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        task_id: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::config(format!(
            "task '{}' has invalid dependency '{}': unknown dependency",
            task_id, dep
        )))
    }

    /// Topological order; ties break on task id so runs are reproducible.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            incoming.entry(id.as_str()).or_insert(0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(&provides, id, dep.as_str())? else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = ready.pop_first() {
            out.push(n);
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            ready.insert(m);
                        }
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out.into_iter().filter_map(|id| self.tasks.get(id)).collect())
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_patch_barrier()
    }

    // Every task providing a "patch:" token feeds the barrier; the build step waits on
    // "patch:done" instead of naming individual features.
    fn add_patch_barrier(&mut self) -> Result<()> {
        if self.tasks.contains_key(PATCH_BARRIER_ID) {
            return Ok(());
        }

        let deps: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with("patch:")))
            .map(|t| t.id.clone())
            .collect();

        self.add(Task {
            id: PATCH_BARRIER_ID.into(),
            label: "Patch barrier".into(),
            module: "core".into(),
            phase: "barrier".into(),
            after: deps,
            provides: vec!["patch:done".into()],
            best_effort: false,
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            let style = if task.best_effort { ", style=dashed" } else { "" };
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"{}];\n",
                task.id, task.label, task.module, task.phase, style
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(&provides, &task.id, dep.as_str())? else {
                    continue;
                };
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
