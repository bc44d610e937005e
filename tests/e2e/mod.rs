mod delegation_tests;
mod lifecycle_tests;
mod revocation_tests;
