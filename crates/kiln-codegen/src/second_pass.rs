//! Condition solving: derives when each surface, modifier and component is
//! active from the tags it requires and the entities enabling those tags.

use std::collections::BTreeSet;

use kiln_ast::{OpRef, PoolError};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    first_pass::{Activation, FirstPass},
    lower::Lowering,
};

/// Entities and tags already on the resolution path.
///
/// Producers are surfaces (`0..surfaces`) followed by modifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
struct Visited {
    positive_producers: BTreeSet<usize>,
    negative_producers: BTreeSet<usize>,
    positive_tags: BTreeSet<usize>,
    negative_tags: BTreeSet<usize>,
}

impl Visited {
    /// Keeps only the entries that can influence a resolution depending on `deps`.
    fn filtered(&self, deps: &Dependencies) -> Visited {
        let keep = |set: &BTreeSet<usize>, allowed: &FxHashSet<usize>| {
            set.iter().filter(|entry| allowed.contains(entry)).copied().collect()
        };
        Visited {
            positive_producers: keep(&self.positive_producers, &deps.producers),
            negative_producers: keep(&self.negative_producers, &deps.producers),
            positive_tags: keep(&self.positive_tags, &deps.tags),
            negative_tags: keep(&self.negative_tags, &deps.tags),
        }
    }
}

/// Everything a tag's condition transitively depends on.
#[derive(Debug, Clone, Default)]
struct Dependencies {
    producers: FxHashSet<usize>,
    tags: FxHashSet<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Polarity {
    Positive,
    Negative,
}

struct Solver<'a> {
    first: &'a FirstPass,
    lowering: &'a Lowering,
    tag_deps: Vec<Dependencies>,
    producer_deps: Vec<Dependencies>,
    tag_cache: FxHashMap<(usize, Polarity, Visited), OpRef>,
    producer_cache: FxHashMap<(usize, Visited), OpRef>,
}

impl<'a> Solver<'a> {
    fn new(first: &'a FirstPass, lowering: &'a Lowering) -> Self {
        let mut solver = Self {
            first,
            lowering,
            tag_deps: Vec::new(),
            producer_deps: Vec::new(),
            tag_cache: FxHashMap::default(),
            producer_cache: FxHashMap::default(),
        };
        solver.tag_deps = (0..first.tags.len()).map(|tag| solver.tag_dependencies(tag)).collect();
        solver.producer_deps = (0..first.surfaces.len() + first.modifiers.len())
            .map(|producer| solver.activation_dependencies(solver.activation(producer)))
            .collect();
        solver
    }

    fn activation(&self, producer: usize) -> &'a Activation {
        let first: &'a FirstPass = self.first;
        match producer.checked_sub(first.surfaces.len()) {
            None => &first.surfaces[producer].activation,
            Some(modifier) => &first.modifiers[modifier].activation,
        }
    }

    fn producers(&self, tag: usize) -> impl Iterator<Item = usize> + 'a {
        let first: &'a FirstPass = self.first;
        let offset = first.surfaces.len();
        first.tags[tag]
            .surfaces
            .iter()
            .copied()
            .chain(first.tags[tag].modifiers.iter().map(move |modifier| offset + modifier))
    }

    fn tags_of(&self, activation: &'a Activation) -> impl Iterator<Item = usize> + 'a {
        let first: &'a FirstPass = self.first;
        activation
            .positive_tags
            .iter()
            .chain(&activation.negative_tags)
            .filter_map(move |tag| first.tag_index(tag))
    }

    fn tag_dependencies(&self, tag: usize) -> Dependencies {
        let mut deps = Dependencies::default();
        deps.tags.insert(tag);
        let mut stack = vec![tag];
        while let Some(tag) = stack.pop() {
            for producer in self.producers(tag) {
                if !deps.producers.insert(producer) {
                    continue;
                }
                for required in self.tags_of(self.activation(producer)) {
                    if deps.tags.insert(required) {
                        stack.push(required);
                    }
                }
            }
        }
        deps
    }

    fn activation_dependencies(&self, activation: &'a Activation) -> Dependencies {
        let mut deps = Dependencies::default();
        for tag in self.tags_of(activation) {
            let tag_deps = &self.tag_deps[tag];
            deps.producers.extend(&tag_deps.producers);
            deps.tags.extend(&tag_deps.tags);
        }
        deps
    }

    /// Condition of `tag` being enabled, or `None` if nothing enables it.
    fn tag_condition(&mut self, tag: usize, polarity: Polarity, visited: &Visited) -> Result<Option<OpRef>, PoolError> {
        if self.producers(tag).next().is_none() {
            return Ok(None);
        }
        if visited.positive_tags.contains(&tag) {
            return self.lowering.pool.bool_constant(true).map(Some);
        }
        if visited.negative_tags.contains(&tag) {
            return self.lowering.pool.bool_constant(false).map(Some);
        }

        let key = (tag, polarity, visited.filtered(&self.tag_deps[tag]));
        if let Some(condition) = self.tag_cache.get(&key) {
            tracing::trace!(tag = %self.first.tags[tag].tag, "Tag condition cache hit");
            return Ok(Some(*condition));
        }

        let mut inner = visited.clone();
        match polarity {
            Polarity::Positive => inner.positive_tags.insert(tag),
            Polarity::Negative => inner.negative_tags.insert(tag),
        };

        let mut any: Option<OpRef> = None;
        for producer in self.producers(tag).collect::<Vec<_>>() {
            if visited.positive_producers.contains(&producer) || visited.negative_producers.contains(&producer) {
                continue;
            }
            let mut producer_visited = inner.clone();
            match polarity {
                Polarity::Positive => producer_visited.positive_producers.insert(producer),
                Polarity::Negative => producer_visited.negative_producers.insert(producer),
            };

            let activation = self.activation(producer);
            let data = self.producer_condition(producer, &producer_visited)?;
            let term = match activation.object_condition {
                Some(object) => self.lowering.and(object, data)?,
                None => data,
            };
            any = Some(match any {
                Some(any) => self.lowering.or(any, term)?,
                None => term,
            });
        }

        let condition = match any {
            Some(condition) => condition,
            None => self.lowering.pool.bool_constant(false)?,
        };
        self.tag_cache.insert(key, condition);
        Ok(Some(condition))
    }

    fn producer_condition(&mut self, producer: usize, visited: &Visited) -> Result<OpRef, PoolError> {
        let key = (producer, visited.filtered(&self.producer_deps[producer]));
        if let Some(condition) = self.producer_cache.get(&key) {
            return Ok(*condition);
        }
        let condition = self.data_condition(self.activation(producer), visited)?;
        self.producer_cache.insert(key, condition);
        Ok(condition)
    }

    /// Conjunction of the entity's positive tags and the negation of its
    /// negative tags.
    ///
    /// A positive tag nothing enables makes the entity unreachable. A negative
    /// tag nothing enables can never exclude it and is skipped.
    fn data_condition(&mut self, activation: &'a Activation, visited: &Visited) -> Result<OpRef, PoolError> {
        let mut condition = self.lowering.pool.bool_constant(true)?;

        for tag in &activation.positive_tags {
            let resolved = match self.first.tag_index(tag) {
                Some(index) => self.tag_condition(index, Polarity::Positive, visited)?,
                None => None,
            };
            match resolved {
                Some(tag_condition) => condition = self.lowering.and(condition, tag_condition)?,
                None => return self.lowering.pool.bool_constant(false),
            }
        }

        for tag in &activation.negative_tags {
            let resolved = match self.first.tag_index(tag) {
                Some(index) => self.tag_condition(index, Polarity::Negative, visited)?,
                None => None,
            };
            if let Some(tag_condition) = resolved {
                let excluded = self.lowering.not(tag_condition)?;
                condition = self.lowering.and(condition, excluded)?;
            }
        }

        Ok(condition)
    }

    /// Object condition and data condition combined; `None` if always true.
    fn final_condition(&mut self, activation: &'a Activation, visited: &Visited) -> Result<Option<OpRef>, PoolError> {
        let data = self.data_condition(activation, visited)?;
        let condition = self.lowering.and_optional(activation.object_condition, Some(data))?;
        Ok(condition.filter(|condition| {
            self.lowering
                .pool
                .get(*condition)
                .map_or(true, |op| op.as_bool_constant() != Some(true))
        }))
    }
}

/// Fills in the final condition of every entity and the generic condition of
/// every tag.
pub(crate) fn solve(first: &mut FirstPass, lowering: &Lowering) -> Result<(), PoolError> {
    let surface_count = first.surfaces.len();
    let (surfaces, modifiers, components, tags) = {
        let mut solver = Solver::new(first, lowering);

        let surfaces = (0..surface_count)
            .map(|index| {
                let visited = Visited {
                    positive_producers: BTreeSet::from([index]),
                    ..Visited::default()
                };
                solver.final_condition(&first.surfaces[index].activation, &visited)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let modifiers = (0..first.modifiers.len())
            .map(|index| {
                let visited = Visited {
                    positive_producers: BTreeSet::from([surface_count + index]),
                    ..Visited::default()
                };
                solver.final_condition(&first.modifiers[index].activation, &visited)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let components = first
            .components
            .iter()
            .map(|component| solver.final_condition(&component.activation, &Visited::default()))
            .collect::<Result<Vec<_>, _>>()?;

        let tags = (0..first.tags.len())
            .map(|tag| {
                match solver.tag_condition(tag, Polarity::Positive, &Visited::default())? {
                    Some(condition) => Ok(condition),
                    None => lowering.pool.bool_constant(false),
                }
            })
            .collect::<Result<Vec<_>, PoolError>>()?;

        (surfaces, modifiers, components, tags)
    };

    for (surface, condition) in first.surfaces.iter_mut().zip(surfaces) {
        surface.activation.final_condition = condition;
    }
    for (modifier, condition) in first.modifiers.iter_mut().zip(modifiers) {
        modifier.activation.final_condition = condition;
    }
    for (component, condition) in first.components.iter_mut().zip(components) {
        component.activation.final_condition = condition;
    }
    for (tag, condition) in first.tags.iter_mut().zip(tags) {
        tag.generic_condition = Some(condition);
    }

    tracing::debug!(tags = first.tags.len(), "Second pass finished");
    Ok(())
}
