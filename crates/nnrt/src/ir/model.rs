use std::collections::BTreeMap;

use crate::error::{Error, Result};

use super::graph::Graph;
use super::index::{ModelIndex, SubgraphIndex};

/// Subgraphs of one model; subgraph 0 is the entry.
#[derive(Debug, Clone, Default)]
pub struct Model {
    subgraphs: BTreeMap<SubgraphIndex, Graph>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model holding a single primary subgraph.
    pub fn single(graph: Graph) -> Self {
        let mut model = Self::new();
        model.push_subgraph(graph);
        model
    }

    pub fn push_subgraph(&mut self, graph: Graph) -> SubgraphIndex {
        let next = self.subgraphs.keys().next_back().map_or(0, |last| last.value() + 1);
        let index = SubgraphIndex::new(next);
        self.subgraphs.insert(index, graph);
        index
    }

    pub fn subgraph(&self, index: SubgraphIndex) -> Option<&Graph> {
        self.subgraphs.get(&index)
    }

    pub fn subgraph_mut(&mut self, index: SubgraphIndex) -> Option<&mut Graph> {
        self.subgraphs.get_mut(&index)
    }

    pub fn primary(&self) -> Option<&Graph> {
        self.subgraph(SubgraphIndex::PRIMARY)
    }

    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn subgraphs(&self) -> impl Iterator<Item = (SubgraphIndex, &Graph)> + '_ {
        self.subgraphs.iter().map(|(index, graph)| (*index, graph))
    }

    pub fn subgraphs_mut(&mut self) -> impl Iterator<Item = (SubgraphIndex, &mut Graph)> + '_ {
        self.subgraphs.iter_mut().map(|(index, graph)| (*index, graph))
    }

    /// Detaches a subgraph for exclusive mutation; pair with [`Model::restore_subgraph`].
    pub(crate) fn take_subgraph(&mut self, index: SubgraphIndex) -> Option<Graph> {
        self.subgraphs.remove(&index)
    }

    pub(crate) fn restore_subgraph(&mut self, index: SubgraphIndex, graph: Graph) {
        self.subgraphs.insert(index, graph);
    }

    pub fn subgraph_indices(&self) -> Vec<SubgraphIndex> {
        self.subgraphs.keys().copied().collect()
    }

    /// Every control-flow reference must point at an existing, different subgraph.
    pub fn verify_references(&self) -> Result<()> {
        for (index, graph) in self.subgraphs() {
            for child in graph.child_subgraphs() {
                if child == index || !self.subgraphs.contains_key(&child) {
                    return Err(Error::unsupported_model(format!(
                        "{index} references invalid subgraph {child}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Models compiled together.
#[derive(Debug, Clone, Default)]
pub struct Package {
    models: BTreeMap<ModelIndex, Model>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_model(&mut self, model: Model) -> ModelIndex {
        let next = self.models.keys().next_back().map_or(0, |last| last.value() + 1);
        let index = ModelIndex::new(next);
        self.models.insert(index, model);
        index
    }

    pub fn model(&self, index: ModelIndex) -> Option<&Model> {
        self.models.get(&index)
    }

    pub fn model_mut(&mut self, index: ModelIndex) -> Option<&mut Model> {
        self.models.get_mut(&index)
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn models(&self) -> impl Iterator<Item = (ModelIndex, &Model)> + '_ {
        self.models.iter().map(|(index, model)| (*index, model))
    }

    pub fn into_models(self) -> impl Iterator<Item = (ModelIndex, Model)> {
        self.models.into_iter()
    }
}

impl From<Model> for Package {
    fn from(model: Model) -> Self {
        let mut package = Package::new();
        package.push_model(model);
        package
    }
}

impl From<Graph> for Package {
    fn from(graph: Graph) -> Self {
        Package::from(Model::single(graph))
    }
}
