mod factory_tests;
mod kernel_device_tests;
mod manager_tests;
mod nvme_device_tests;
