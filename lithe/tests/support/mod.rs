pub mod toy_2ls;
