use crate::template::{collect_references, parse_reference};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use weftcore::{StepId, WorkflowDefinition};

/// A `{{ name.path }}` reference whose first segment is neither a step nor
/// a known variable at build time. It yields no edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub step_id: StepId,
    pub reference: String,
}

/// Dependencies of every step: explicit edges (reverse of `next_steps`, plus
/// `depends_on`) unioned with data edges inferred from `{{ step.path }}`
/// references in parameters and conditions.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<StepId>,
    dependencies: HashMap<StepId, BTreeSet<StepId>>,
    dependents: HashMap<StepId, BTreeSet<StepId>>,
    dangling: Vec<DanglingReference>,
}

impl DependencyGraph {
    pub fn build(definition: &WorkflowDefinition) -> Self {
        let order: Vec<StepId> = definition.steps.iter().map(|s| s.step_id.clone()).collect();
        let known: HashSet<&str> = order.iter().map(String::as_str).collect();

        let mut dependencies: HashMap<StepId, BTreeSet<StepId>> =
            order.iter().map(|id| (id.clone(), BTreeSet::new())).collect();
        let mut dangling = Vec::new();

        for step in &definition.steps {
            for next in &step.next_steps {
                if let Some(deps) = dependencies.get_mut(next) {
                    deps.insert(step.step_id.clone());
                }
            }
            for dep in &step.depends_on {
                if known.contains(dep.as_str()) {
                    insert(&mut dependencies, &step.step_id, dep);
                }
            }

            let mut references = Vec::new();
            for value in step.parameters.values() {
                collect_references(value, &mut references);
            }
            for condition in &step.conditions {
                collect_references(&condition.left, &mut references);
                collect_references(&condition.right, &mut references);
            }

            for reference in references {
                let Some(segments) = parse_reference(&reference) else {
                    continue;
                };
                // A bare name is a variable, never a step output.
                if segments.len() < 2 {
                    continue;
                }
                if known.contains(segments[0]) {
                    insert(&mut dependencies, &step.step_id, segments[0]);
                } else {
                    dangling.push(DanglingReference {
                        step_id: step.step_id.clone(),
                        reference,
                    });
                }
            }
        }

        let mut dependents: HashMap<StepId, BTreeSet<StepId>> =
            order.iter().map(|id| (id.clone(), BTreeSet::new())).collect();
        for (step, deps) in &dependencies {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(step.clone());
                }
            }
        }

        Self {
            order,
            dependencies,
            dependents,
            dangling,
        }
    }

    /// Step ids in declaration order.
    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    pub fn dependencies_of(&self, step_id: &str) -> Option<&BTreeSet<StepId>> {
        self.dependencies.get(step_id)
    }

    pub fn dependents_of(&self, step_id: &str) -> Option<&BTreeSet<StepId>> {
        self.dependents.get(step_id)
    }

    pub fn dependencies(&self) -> &HashMap<StepId, BTreeSet<StepId>> {
        &self.dependencies
    }

    /// References that matched no step. Some of them may be object-valued
    /// variables, which are only known at run time.
    pub fn dangling(&self) -> &[DanglingReference] {
        &self.dangling
    }

    /// Steps without dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&StepId> {
        self.order
            .iter()
            .filter(|id| self.dependencies.get(*id).is_some_and(BTreeSet::is_empty))
            .collect()
    }

    /// Every step downstream of any of `sources`, excluding the sources.
    pub fn transitive_dependents<'a, I>(&self, sources: I) -> BTreeSet<StepId>
    where
        I: IntoIterator<Item = &'a StepId>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&StepId> = sources.into_iter().collect();
        let origin: HashSet<&StepId> = queue.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            for next in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen.retain(|id| !origin.contains(id));
        seen
    }

    /// Dependency cycles, each listed in declaration order. A step that
    /// depends on itself is a cycle of one.
    pub fn cycles(&self) -> Vec<Vec<StepId>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .order
            .iter()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (step, deps) in &self.dependencies {
            for dep in deps {
                if let (Some(&from), Some(&to)) = (index.get(dep.as_str()), index.get(step.as_str())) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut cycles: Vec<Vec<StepId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || graph.find_edge(component[0], component[0]).is_some()
            })
            .map(|component| {
                let mut ids: Vec<&str> = component.iter().map(|idx| graph[*idx]).collect();
                ids.sort_by_key(|id| position[id]);
                ids.into_iter().map(str::to_string).collect()
            })
            .collect();
        cycles.sort_by_key(|cycle| position[cycle[0].as_str()]);
        cycles
    }
}

fn insert(dependencies: &mut HashMap<StepId, BTreeSet<StepId>>, step: &str, dependency: &str) {
    if let Some(deps) = dependencies.get_mut(step) {
        deps.insert(dependency.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftcore::{ConditionOperator, StepCondition, StepType, WorkflowStep};

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::SystemReasoning)
    }

    fn set(ids: &[&str]) -> BTreeSet<StepId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // ---------------------------------------------------------------
    // Edge sources
    // ---------------------------------------------------------------

    #[test]
    fn explicit_edges_from_next_steps_and_depends_on() {
        let wf = WorkflowDefinition::new("explicit")
            .with_step(step("a").with_next("b"))
            .with_step(step("b"))
            .with_step(step("c").with_dependency("b"));
        let graph = DependencyGraph::build(&wf);

        assert_eq!(graph.dependencies_of("a"), Some(&set(&[])));
        assert_eq!(graph.dependencies_of("b"), Some(&set(&["a"])));
        assert_eq!(graph.dependencies_of("c"), Some(&set(&["b"])));
        assert_eq!(graph.dependents_of("a"), Some(&set(&["b"])));
    }

    #[test]
    fn implicit_edges_from_parameters_and_conditions() {
        let wf = WorkflowDefinition::new("implicit")
            .with_step(step("fetch"))
            .with_step(step("score"))
            .with_step(
                step("notify")
                    .with_parameter("message", "{{fetch.url}}")
                    .with_condition(StepCondition::new("{{ score.value }}", ConditionOperator::Gt, 3)),
            );
        let graph = DependencyGraph::build(&wf);
        assert_eq!(graph.dependencies_of("notify"), Some(&set(&["fetch", "score"])));
    }

    #[test]
    fn bare_names_and_json_text_make_no_edges() {
        let wf = WorkflowDefinition::new("plain")
            .with_step(step("fetch"))
            .with_step(
                step("notify")
                    .with_parameter("who", "{{fetch}}")
                    .with_parameter("body", r#"{"fetch": {"url": 1}}"#),
            );
        let graph = DependencyGraph::build(&wf);
        assert_eq!(graph.dependencies_of("notify"), Some(&set(&[])));
        assert!(graph.dangling().is_empty());
    }

    #[test]
    fn unknown_steps_are_recorded_as_dangling() {
        let wf = WorkflowDefinition::new("dangling")
            .with_step(step("notify").with_parameter("to", "{{lookup.email}}"));
        let graph = DependencyGraph::build(&wf);
        assert_eq!(graph.dependencies_of("notify"), Some(&set(&[])));
        assert_eq!(
            graph.dangling(),
            &[DanglingReference {
                step_id: "notify".into(),
                reference: "lookup.email".into()
            }]
        );
    }

    // ---------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------

    #[test]
    fn multiple_roots_in_declaration_order() {
        let wf = WorkflowDefinition::new("roots")
            .with_step(step("c"))
            .with_step(step("a"))
            .with_step(step("b").with_dependency("a"));
        let graph = DependencyGraph::build(&wf);
        let roots: Vec<&str> = graph.roots().into_iter().map(String::as_str).collect();
        assert_eq!(roots, vec!["c", "a"]);
    }

    #[test]
    fn transitive_dependents_excludes_sources() {
        let wf = WorkflowDefinition::new("chain")
            .with_step(step("a"))
            .with_step(step("b").with_dependency("a"))
            .with_step(step("c").with_dependency("b"))
            .with_step(step("d"));
        let graph = DependencyGraph::build(&wf);
        let a = "a".to_string();
        assert_eq!(graph.transitive_dependents([&a]), set(&["b", "c"]));
    }

    #[test]
    fn cycles_are_reported() {
        let wf = WorkflowDefinition::new("cycle")
            .with_step(step("start"))
            .with_step(step("y").with_dependency("x"))
            .with_step(step("x").with_dependency("y"))
            .with_step(step("me").with_parameter("v", "{{me.out}}"));
        let graph = DependencyGraph::build(&wf);
        assert_eq!(
            graph.cycles(),
            vec![vec!["y".to_string(), "x".to_string()], vec!["me".to_string()]]
        );
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let wf = WorkflowDefinition::new("dag")
            .with_step(step("a").with_next("b"))
            .with_step(step("b"));
        assert!(DependencyGraph::build(&wf).cycles().is_empty());
    }
}
