use crate::unit::ComputeUnit;

/// Order in which a unit tree is saved, uploaded and deployed.
///
/// Post-order over the dependency DAG: every unit appears after all of its
/// dependencies, shared children appear once, and the root is last.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub units: Vec<ComputeUnit>,
}

impl DeploymentPlan {
    pub fn generate(root: &ComputeUnit) -> Self {
        let mut units = Vec::new();
        visit(root, &mut units);
        Self { units }
    }

    pub fn root(&self) -> Option<&ComputeUnit> {
        self.units.last()
    }

    /// Every unit but the root, dependencies first.
    pub fn dependencies(&self) -> &[ComputeUnit] {
        match self.units.split_last() {
            Some((_, deps)) => deps,
            None => &[],
        }
    }

    /// Teardown order: root first, then dependencies in reverse.
    pub fn teardown_order(&self) -> impl Iterator<Item = &ComputeUnit> {
        self.units.iter().rev()
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(ComputeUnit::name).collect()
    }
}

fn visit(unit: &ComputeUnit, out: &mut Vec<ComputeUnit>) {
    if out.iter().any(|u| u.same_unit(unit)) {
        return;
    }
    for dep in unit.dependencies() {
        visit(&dep, out);
    }
    out.push(unit.clone());
}
