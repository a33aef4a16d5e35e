//! SCPI driver whose quantities are all declared by the instrument record.

use crate::driver::{Driver, DriverArgs, DriverTemplate};
use crate::error::{DriverError, DriverResult};
use crate::scpi::ScpiDriver;
use std::collections::HashSet;

/// Registry factory for `GenericScpi`.
pub fn generic_scpi(args: DriverArgs) -> DriverResult<Box<dyn Driver>> {
    let mut seen = HashSet::new();
    if let Some(dup) = args.quantities.iter().find(|q| !seen.insert(q.name.as_str())) {
        return Err(DriverError::Configuration(format!(
            "quantity '{}' declared twice for {}",
            dup.name,
            args.descriptor.addr()
        )));
    }
    Ok(Box::new(ScpiDriver::new(args, &DriverTemplate::default())))
}
