/// Header chain parameters.

/// Number of most recent hashes listed one by one at the head of a locator
/// before the step starts doubling.
pub const LOCATOR_DENSE_ENTRIES: usize = 10;

/// Upper bound on locator length; the initial block hash is always last.
pub const MAX_LOCATOR_HASHES: usize = 64;
