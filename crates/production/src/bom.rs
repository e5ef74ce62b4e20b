//! Bills of materials and material requirement planning.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use shopfloor_core::{DomainError, DomainResult, Quantity};
use shopfloor_inventory::{InventoryItemId, ProcessName};

/// Requirements are rounded up to this many decimal places.
const REQUIREMENT_DP: u32 = 4;

/// One component line of a BOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomComponent {
    pub item_id: InventoryItemId,
    /// Quantity needed per `output_quantity` of the output item.
    pub quantity_required: Quantity,
    /// WIP bucket the component sits in between issue and consumption.
    pub process: ProcessName,
    /// Expected loss, in percent, added on top of the net requirement.
    pub scrap_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillOfMaterials {
    output_item: InventoryItemId,
    output_quantity: Quantity,
    components: Vec<BomComponent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRequirement {
    pub item_id: InventoryItemId,
    pub process: ProcessName,
    pub required: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub item_id: InventoryItemId,
    pub required: Quantity,
    pub available: Quantity,
    pub shortage: Quantity,
}

impl BillOfMaterials {
    pub fn new(
        output_item: InventoryItemId,
        output_quantity: Quantity,
        components: Vec<BomComponent>,
    ) -> DomainResult<Self> {
        if output_quantity.is_zero() {
            return Err(DomainError::validation("BOM output quantity must be positive"));
        }
        if components.is_empty() {
            return Err(DomainError::validation("BOM needs at least one component"));
        }

        for (idx, component) in components.iter().enumerate() {
            if component.item_id == output_item {
                return Err(DomainError::validation(
                    "BOM output item cannot be its own component",
                ));
            }
            if component.quantity_required.is_zero() {
                return Err(DomainError::validation(
                    "component quantity must be positive",
                ));
            }
            if component.scrap_percent.is_sign_negative()
                || component.scrap_percent >= Decimal::ONE_HUNDRED
            {
                return Err(DomainError::validation(
                    "scrap percent must be in [0, 100)",
                ));
            }
            if components[..idx].iter().any(|c| c.item_id == component.item_id) {
                return Err(DomainError::validation(format!(
                    "component {} listed twice",
                    component.item_id
                )));
            }
        }

        Ok(Self {
            output_item,
            output_quantity,
            components,
        })
    }

    pub fn output_item(&self) -> InventoryItemId {
        self.output_item
    }

    pub fn output_quantity(&self) -> Quantity {
        self.output_quantity
    }

    pub fn components(&self) -> &[BomComponent] {
        &self.components
    }

    pub fn component(&self, item_id: InventoryItemId) -> Option<&BomComponent> {
        self.components.iter().find(|c| c.item_id == item_id)
    }

    /// Gross component requirement for `planned` units of output:
    /// `quantity_required × planned / output_quantity × (1 + scrap% / 100)`.
    pub fn requirements(&self, planned: Quantity) -> DomainResult<Vec<MaterialRequirement>> {
        let ratio = planned
            .value()
            .checked_div(self.output_quantity.value())
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;

        self.components
            .iter()
            .map(|component| {
                let allowance = Decimal::ONE + component.scrap_percent / Decimal::ONE_HUNDRED;
                let gross = component.quantity_required.scale(ratio)?.scale(allowance)?;
                let required = Quantity::new(gross.value().round_dp_with_strategy(
                    REQUIREMENT_DP,
                    RoundingStrategy::AwayFromZero,
                ))?;
                Ok(MaterialRequirement {
                    item_id: component.item_id,
                    process: component.process.clone(),
                    required,
                })
            })
            .collect()
    }

    /// Components whose raw stock cannot cover the requirement.
    pub fn shortages<F>(&self, planned: Quantity, available_raw: F) -> DomainResult<Vec<Shortage>>
    where
        F: Fn(InventoryItemId) -> Quantity,
    {
        let shortages = self
            .requirements(planned)?
            .into_iter()
            .filter_map(|req| {
                let available = available_raw(req.item_id);
                let shortage = req.required.saturating_sub(available);
                (!shortage.is_zero()).then_some(Shortage {
                    item_id: req.item_id,
                    required: req.required,
                    available,
                    shortage,
                })
            })
            .collect();
        Ok(shortages)
    }
}
