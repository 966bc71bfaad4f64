use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::execution::ProcessExecutor;
use crate::gadgets::{EncoderGadget, FileProcessorGadget, Gadget, GadgetResult, ScannerGadget};
use crate::models::{CoreError, CoreErrorKind, GadgetInfo, ModeInfo};

type GadgetConstructor = Arc<dyn Fn() -> Box<dyn Gadget> + Send + Sync>;

/// Startup registration table mapping gadget ids to constructors.
#[derive(Clone, Default)]
pub struct GadgetRegistry {
    constructors: BTreeMap<String, GadgetConstructor>,
}

impl GadgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the built-in gadgets. The scanner is skipped with a warning
    /// when `nmap` is not installed.
    pub fn with_builtin_gadgets(
        executor: Arc<dyn ProcessExecutor>,
        cancel_grace: Duration,
    ) -> GadgetResult<Self> {
        let mut registry = Self::new();
        registry.register(EncoderGadget::new)?;
        registry.register(FileProcessorGadget::new)?;

        let scanner = ScannerGadget::discover(executor).with_grace_period(cancel_grace);
        if let Some(binary) = scanner.binary() {
            tracing::debug!(binary = %binary.display(), "found nmap for the scanner gadget");
        }
        if let Err(error) = registry.register(move || scanner.clone()) {
            tracing::warn!(
                gadget = "scanner",
                error = %error.message,
                "skipping gadget with unmet requirements"
            );
        }

        Ok(registry)
    }

    /// Builds one instance to validate it and learn its id. Fails on a
    /// duplicate id or when validation fails.
    pub fn register<G, F>(&mut self, constructor: F) -> GadgetResult<()>
    where
        G: Gadget + 'static,
        F: Fn() -> G + Send + Sync + 'static,
    {
        let probe = constructor();
        let id = probe.descriptor().id.to_string();
        probe.validate()?;

        if self.constructors.contains_key(&id) {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("duplicate gadget registration for '{id}'"),
            )
            .gadget(id));
        }

        tracing::debug!(gadget = %id, "registered gadget");
        self.constructors
            .insert(id, Arc::new(move || Box::new(constructor()) as Box<dyn Gadget>));
        Ok(())
    }

    /// Returns a fresh handler instance for `gadget_id`.
    pub fn resolve(&self, gadget_id: &str) -> GadgetResult<Box<dyn Gadget>> {
        self.constructors
            .get(gadget_id)
            .map(|constructor| constructor())
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::GadgetNotFound,
                    format!("no gadget is registered with id '{gadget_id}'"),
                )
                .gadget(gadget_id)
            })
    }

    pub fn contains(&self, gadget_id: &str) -> bool {
        self.constructors.contains_key(gadget_id)
    }

    pub fn gadget_ids(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn describe_all(&self) -> Vec<GadgetInfo> {
        self.constructors
            .values()
            .map(|constructor| describe(constructor().as_ref()))
            .collect()
    }
}

fn describe(gadget: &dyn Gadget) -> GadgetInfo {
    let descriptor = gadget.descriptor();
    GadgetInfo {
        id: descriptor.id.to_string(),
        name: descriptor.name.to_string(),
        description: descriptor.description.to_string(),
        modes: gadget
            .modes()
            .into_iter()
            .map(|mode| ModeInfo {
                id: mode.id.to_string(),
                name: mode.name.to_string(),
                description: mode.description.to_string(),
                form_schema: gadget.form_schema(mode.id),
            })
            .collect(),
    }
}
