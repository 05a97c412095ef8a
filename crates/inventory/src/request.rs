//! Typed requests validated at the ingestion boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use batchledger_core::{DomainError, DomainResult, LocationId, ProductId, UserId};

use crate::batch::{BatchAttributes, QualityStatus};

/// Where a creation request came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchSource {
    #[default]
    Manual,
    DocumentExtraction { document_ref: String },
}

/// Batch creation request.
///
/// Manual entry and the document-extraction pipeline both submit this shape;
/// nothing free-form reaches the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub product_id: ProductId,
    pub quantity_produced: i64,
    pub manufacturing_date: NaiveDate,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub rolls: Option<i64>,
    #[serde(default)]
    pub weight_grams: Option<i64>,
    #[serde(default)]
    pub cost_price: Option<i64>,
    #[serde(default)]
    pub quality_status: QualityStatus,
    #[serde(default)]
    pub initial_location: Option<LocationId>,
    #[serde(default)]
    pub produced_by: Option<UserId>,
    #[serde(default)]
    pub wastage_quantity: i64,
    #[serde(default)]
    pub wastage_cost: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source: BatchSource,
}

impl NewBatch {
    /// Minimal request; optional attributes default to empty.
    pub fn new(product_id: ProductId, quantity_produced: i64, manufacturing_date: NaiveDate) -> Self {
        Self {
            product_id,
            quantity_produced,
            manufacturing_date,
            expiry_date: None,
            rolls: None,
            weight_grams: None,
            cost_price: None,
            quality_status: QualityStatus::Pending,
            initial_location: None,
            produced_by: None,
            wastage_quantity: 0,
            wastage_cost: 0,
            notes: None,
            source: BatchSource::Manual,
        }
    }

    pub fn into_attributes(self) -> DomainResult<(BatchAttributes, BatchSource)> {
        let attributes = BatchAttributes {
            product_id: self.product_id,
            quantity_produced: self.quantity_produced,
            manufacturing_date: self.manufacturing_date,
            expiry_date: self.expiry_date,
            rolls: self.rolls,
            weight_grams: self.weight_grams,
            cost_price: self.cost_price,
            quality_status: self.quality_status,
            initial_location: self.initial_location,
            produced_by: self.produced_by,
            wastage_quantity: self.wastage_quantity,
            wastage_cost: self.wastage_cost,
            notes: self.notes,
        };
        attributes.validate()?;
        Ok((attributes, self.source))
    }
}

/// One requested allocation of batch quantity to a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub location_id: LocationId,
    pub quantity: i64,
}

impl AllocationLine {
    pub fn new(location_id: LocationId, quantity: i64) -> Self {
        Self {
            location_id,
            quantity,
        }
    }
}

/// A validated allocation request: positive quantities, one line per
/// location, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    lines: Vec<AllocationLine>,
    total: i64,
}

impl AllocationPlan {
    pub fn from_lines(lines: &[AllocationLine]) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("allocation request has no lines"));
        }

        let mut merged: Vec<AllocationLine> = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity < 0 {
                return Err(DomainError::validation(format!(
                    "allocation quantity for location {} cannot be negative (got {})",
                    line.location_id, line.quantity
                )));
            }
            if line.quantity == 0 {
                continue;
            }
            match merged.iter_mut().find(|l| l.location_id == line.location_id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.checked_add(line.quantity).ok_or_else(
                        || DomainError::validation("allocation quantity overflow"),
                    )?;
                }
                None => merged.push(*line),
            }
        }

        if merged.is_empty() {
            return Err(DomainError::validation(
                "allocation request has no positive quantity",
            ));
        }

        let total = merged
            .iter()
            .try_fold(0i64, |acc, l| acc.checked_add(l.quantity))
            .ok_or_else(|| DomainError::validation("allocation quantity overflow"))?;

        Ok(Self {
            lines: merged,
            total,
        })
    }

    /// Whole remaining quantity of a batch to one location.
    pub fn single(location_id: LocationId, quantity: i64) -> DomainResult<Self> {
        Self::from_lines(&[AllocationLine::new(location_id, quantity)])
    }

    pub fn lines(&self) -> &[AllocationLine] {
        &self.lines
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}
