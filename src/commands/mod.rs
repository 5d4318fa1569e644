mod instances;
mod run;
mod validate;

pub use instances::{run_instances_clean, run_instances_list};
pub use run::run_script;
pub use validate::run_validate;
