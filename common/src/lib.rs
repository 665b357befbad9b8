pub mod program_transformations;
