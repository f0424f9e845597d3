//! Run-wide base CRS selection and per-batch reconciliation.

use bdgd_map_database_models::{Crs, SpatialBatch};

use crate::{GeometryError, Reprojector};

/// How the run's base CRS is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrsPolicy {
    /// The first successfully loaded spatial layer sets the base CRS.
    /// Later layers in another CRS are processed as-is with a warning.
    AdoptFirst,
    /// Every layer is reprojected into this CRS.
    Force(Crs),
}

/// What to do with one incoming batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Already in the base CRS (or it just became the base CRS).
    PassThrough,
    /// Must be transformed before joining.
    Reproject {
        /// The batch CRS.
        from: Crs,
        /// The base CRS.
        to: Crs,
    },
    /// Differs from the base CRS but no forced policy is active.
    Mismatch {
        /// The base CRS.
        expected: Crs,
        /// The batch CRS.
        found: Crs,
    },
}

/// State shared by every stage of a single pipeline run.
///
/// The base CRS is assigned at most once: at construction for
/// [`CrsPolicy::Force`], or by the first reconciled batch for
/// [`CrsPolicy::AdoptFirst`].
#[derive(Debug, Clone)]
pub struct RunContext {
    policy: CrsPolicy,
    base_crs: Option<Crs>,
}

impl RunContext {
    /// Creates a run context for the given policy.
    #[must_use]
    pub fn new(policy: CrsPolicy) -> Self {
        let base_crs = match &policy {
            CrsPolicy::AdoptFirst => None,
            CrsPolicy::Force(target) => Some(target.clone()),
        };
        Self { policy, base_crs }
    }

    /// The base CRS, once known.
    #[must_use]
    pub const fn base_crs(&self) -> Option<&Crs> {
        self.base_crs.as_ref()
    }

    /// Decides how a batch in CRS `found` is brought into the base CRS,
    /// adopting `found` as the base if none is set yet.
    pub fn reconcile(&mut self, found: &Crs) -> Reconciliation {
        let Some(base) = &self.base_crs else {
            log::info!("Adopting {found} as the base CRS");
            self.base_crs = Some(found.clone());
            return Reconciliation::PassThrough;
        };

        if base == found {
            return Reconciliation::PassThrough;
        }

        match &self.policy {
            CrsPolicy::Force(_) => Reconciliation::Reproject {
                from: found.clone(),
                to: base.clone(),
            },
            CrsPolicy::AdoptFirst => Reconciliation::Mismatch {
                expected: base.clone(),
                found: found.clone(),
            },
        }
    }
}

/// Brings a validated batch into the run's base CRS.
///
/// Mismatches under [`CrsPolicy::AdoptFirst`] are logged and the batch is
/// relabelled with the base CRS without touching its coordinates.
///
/// # Errors
///
/// Returns [`GeometryError`] if reprojection is required and fails.
pub fn reconcile_batch(
    ctx: &mut RunContext,
    batch: SpatialBatch,
) -> Result<SpatialBatch, GeometryError> {
    match ctx.reconcile(&batch.crs) {
        Reconciliation::PassThrough => Ok(batch),
        Reconciliation::Mismatch { expected, found } => {
            log::warn!(
                "Spatial layer CRS {found} differs from base CRS {expected}; processing without reprojection"
            );
            Ok(SpatialBatch {
                crs: expected,
                ..batch
            })
        }
        Reconciliation::Reproject { from, to } => {
            log::info!("Reprojecting {} geometries from {from} to {to}", batch.len());
            let reprojector = Reprojector::new(&from, &to)?;
            let geometries = batch
                .geometries
                .iter()
                .map(|g| g.as_ref().map(|g| reprojector.transform(g)).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SpatialBatch {
                crs: to,
                attributes: batch.attributes,
                geometries,
            })
        }
    }
}
