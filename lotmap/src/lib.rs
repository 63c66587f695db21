#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{
    format_timestamp, load_config, open_database, parse_site_ids, render_group, render_sites,
    render_status, select_run, select_sites,
};
