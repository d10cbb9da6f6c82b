pub mod lifecycle;
pub mod sequence_tracker;
pub mod session_record;
pub mod session_table;
