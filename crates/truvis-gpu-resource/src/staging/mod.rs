pub mod staging_ring;
