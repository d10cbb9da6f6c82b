pub mod end_point;
pub mod reception;
pub mod send_socket;
pub mod supervisor;
pub mod transmission;
