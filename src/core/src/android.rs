pub mod inspect;
pub mod rootmgr;
pub mod sysprop;
