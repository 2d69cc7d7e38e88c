// Test modules for Portlease
// Shared fakes live in `support`

mod manager_tests;
mod support;
