//! Deferred component lookup.
//!
//! A [`Selector`] names a component by its position in the model tree and is
//! only resolved when a value is read or written, so it may be declared
//! before the component exists.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Component, Facility};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// The evaluation target itself: the facility, or a sensitivity analyser
    /// when one wraps the model.
    Root,
    Facility,
    Product(usize),
    /// A step found by name within a product's process sequence.
    Step { product: usize, name: String },
}

impl Selector {
    pub fn step(product: usize, name: &str) -> Self {
        Selector::Step {
            product,
            name: name.to_string(),
        }
    }

    /// Resolve against `facility`. `Root` is the facility here; wrappers that
    /// are their own root handle it before delegating.
    pub fn resolve<'a>(&self, facility: &'a Facility) -> Result<&'a Component> {
        match self {
            Selector::Root | Selector::Facility => Ok(&facility.component),
            Selector::Product(index) => facility
                .product(*index)
                .map(|p| &p.component)
                .ok_or_else(|| self.missing_product(facility, *index)),
            Selector::Step { product, name } => {
                let p = facility
                    .product(*product)
                    .ok_or_else(|| self.missing_product(facility, *product))?;
                let sequence = p
                    .sequence
                    .as_ref()
                    .ok_or_else(|| Error::lookup(self, format!("product {} has no process sequence", p.name())))?;
                sequence
                    .find_step(name)
                    .map(|s| &s.component)
                    .ok_or_else(|| {
                        Error::lookup(
                            self,
                            format!("no step named \"{name}\" in the sequence of product {}", p.name()),
                        )
                    })
            }
        }
    }

    pub fn resolve_mut<'a>(&self, facility: &'a mut Facility) -> Result<&'a mut Component> {
        // Check with a shared borrow first so the error can describe the tree.
        self.resolve(facility)?;
        let found = match self {
            Selector::Root | Selector::Facility => Some(&mut facility.component),
            Selector::Product(index) => facility.product_mut(*index).map(|p| &mut p.component),
            Selector::Step { product, name } => facility
                .product_mut(*product)
                .and_then(|p| p.sequence.as_mut())
                .and_then(|s| s.find_step_mut(name))
                .map(|s| &mut s.component),
        };
        found.ok_or_else(|| Error::lookup(self, "component disappeared during lookup"))
    }

    fn missing_product(&self, facility: &Facility, index: usize) -> Error {
        Error::lookup(
            self,
            format!(
                "product index {index} out of range; facility {} has {} products",
                facility.name(),
                facility.products().len()
            ),
        )
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Root => f.write_str("self"),
            Selector::Facility => f.write_str("facility"),
            Selector::Product(i) => write!(f, "product[{i}]"),
            Selector::Step { product, name } => write!(f, "step[{product}:{name}]"),
        }
    }
}

/// Path to a field, with one element per level of nesting, e.g.
/// `("titre", "avg")` for the average of an analyser output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemPath(pub Vec<String>);

impl ItemPath {
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for ItemPath {
    fn from(item: &str) -> Self {
        ItemPath(vec![item.to_string()])
    }
}

impl From<String> for ItemPath {
    fn from(item: String) -> Self {
        ItemPath(vec![item])
    }
}

impl From<(&str, &str)> for ItemPath {
    fn from((group, item): (&str, &str)) -> Self {
        ItemPath(vec![group.to_string(), item.to_string()])
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessSequence, Product, Role, Step};

    fn facility() -> Facility {
        let noop = |_: &mut Component| -> Result<()> { Ok(()) };
        let step = Step::new(Component::new("capture", &Role::new("step")), noop);
        let seq = ProcessSequence::new("seq", vec![step]).unwrap();
        let mut f = Facility::new(Component::new("plant", &Role::new("facility")));
        f.add_product(Product::new(Component::new("mAb", &Role::new("product")), Some(seq)));
        f.add_product(Product::new(Component::new("bare", &Role::new("product")), None));
        f
    }

    #[test]
    fn test_resolves_each_form() {
        let f = facility();
        assert_eq!(Selector::Root.resolve(&f).unwrap().name(), "plant");
        assert_eq!(Selector::Facility.resolve(&f).unwrap().name(), "plant");
        assert_eq!(Selector::Product(0).resolve(&f).unwrap().name(), "mAb");
        assert_eq!(Selector::step(0, "capture").resolve(&f).unwrap().name(), "capture");
    }

    #[test]
    fn test_missing_components_are_lookup_errors() {
        let mut f = facility();
        for sel in [
            Selector::Product(5),
            Selector::step(0, "polish"),
            Selector::step(1, "capture"),
            Selector::step(9, "capture"),
        ] {
            assert!(matches!(sel.resolve(&f), Err(Error::Lookup { .. })), "{sel}");
            assert!(matches!(sel.resolve_mut(&mut f), Err(Error::Lookup { .. })), "{sel}");
        }
    }

    #[test]
    fn test_display_and_serde() {
        let sel = Selector::step(0, "capture");
        assert_eq!(sel.to_string(), "step[0:capture]");
        let json = serde_json::to_string(&sel).unwrap();
        let back: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sel);
        assert_eq!(ItemPath::from(("titre", "avg")).to_string(), "titre.avg");
    }
}
