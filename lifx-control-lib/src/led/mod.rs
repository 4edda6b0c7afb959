pub mod hsbk;
