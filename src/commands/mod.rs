pub(crate) mod genenv;
pub(crate) mod observability;
pub(crate) mod status;
pub(crate) mod sync;
