// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable unique IDs for the nodes of the test hierarchy.
//!
//! An ID is the hex-encoded SHA-256 of its components. Each component is prefixed with its
//! length, so `("ab", "c")` and `("a", "bc")` produce different IDs. Missing components hash
//! differently from empty ones.

use sha2::{Digest, Sha256};

struct UniqueIdBuilder {
    hasher: Sha256,
}

impl UniqueIdBuilder {
    fn new(kind: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.add(kind);
        builder
    }

    fn add(&mut self, component: &str) -> &mut Self {
        self.hasher.update([1u8]);
        self.hasher.update((component.len() as u64).to_le_bytes());
        self.hasher.update(component.as_bytes());
        self
    }

    fn add_opt(&mut self, component: Option<&str>) -> &mut Self {
        match component {
            Some(component) => self.add(component),
            None => {
                self.hasher.update([0u8]);
                self
            }
        }
    }

    fn add_list<'a>(&mut self, components: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let components: Vec<_> = components.into_iter().collect();
        self.hasher.update((components.len() as u64).to_le_bytes());
        for component in components {
            self.add(component);
        }
        self
    }

    fn finish(&mut self) -> String {
        hex::encode(self.hasher.finalize_reset())
    }
}

/// The ID of an assembly, from its name, path and config file.
pub fn for_assembly(name: &str, path: Option<&str>, config_file: Option<&str>) -> String {
    UniqueIdBuilder::new("assembly")
        .add(name)
        .add_opt(path)
        .add_opt(config_file)
        .finish()
}

/// The ID of a collection within an assembly.
pub fn for_collection(
    assembly_id: &str,
    display_name: &str,
    definition_type: Option<&str>,
) -> String {
    UniqueIdBuilder::new("collection")
        .add(assembly_id)
        .add(display_name)
        .add_opt(definition_type)
        .finish()
}

/// The ID of a class within a collection.
pub fn for_class(collection_id: &str, class_name: &str) -> String {
    UniqueIdBuilder::new("class")
        .add(collection_id)
        .add(class_name)
        .finish()
}

/// The ID of a method within a class.
pub fn for_method(class_id: &str, method_name: &str) -> String {
    UniqueIdBuilder::new("method")
        .add(class_id)
        .add(method_name)
        .finish()
}

/// The ID of a test case, from its method, generic bindings and argument display values.
pub fn for_test_case<'a>(
    method_id: &str,
    generic_bindings: impl IntoIterator<Item = &'a str>,
    argument_displays: impl IntoIterator<Item = &'a str>,
) -> String {
    UniqueIdBuilder::new("test-case")
        .add(method_id)
        .add_list(generic_bindings)
        .add_list(argument_displays)
        .finish()
}

/// The ID of the `index`th test of a test case.
pub fn for_test(test_case_id: &str, index: usize) -> String {
    UniqueIdBuilder::new("test")
        .add(test_case_id)
        .add(&index.to_string())
        .finish()
}
