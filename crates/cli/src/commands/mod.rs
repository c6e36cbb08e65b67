pub(crate) mod run;
pub(crate) mod validate;

pub(crate) use run::{cmd_run, RunOptions};
pub(crate) use validate::cmd_validate;
