pub mod bitvavo;
