#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("Expected Ok(_), got Err({:?})", err),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!(concat!("Expected Ok(_): ", $($arg)+, ": {:?}"), err),
        }
    };
}

/// Asserts that `$expr` fails with a `BlkError` matching `$pat`.
#[macro_export]
macro_rules! assert_blk_err {
    ($expr:expr, $pat:pat) => {
        match $expr {
            Err(err @ $pat) => err,
            Err(other) => panic!("Expected Err({}), got Err({:?})", stringify!($pat), other),
            Ok(_) => panic!("Expected Err({}), got Ok(_)", stringify!($pat)),
        }
    };
}
