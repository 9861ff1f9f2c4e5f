pub mod ports;


